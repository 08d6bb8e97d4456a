//! Error taxonomy for the simulation core.
//!
//! Kernels and drivers return `Result<_, LithosError>`; soft conditions
//! (pixel rescues, budget overruns) are tallied in metrics instead of
//! surfacing as errors.

use thiserror::Error;

/// Why Stage B amplification could not be used, recorded with a structured
/// code so exports can explain their fallback to baseline elevations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmplificationNotReady {
    /// Amplification disabled in the configuration.
    NotEnabled,
    /// The skip flag was set by a caller.
    SkipFlagSet,
    /// Render LOD below `min_amplification_lod`.
    LodTooLow,
    /// Amplified buffer length does not match the vertex count.
    ArraySizeMismatch,
    /// Snapshot serial no longer matches the simulation state.
    SerialDrifted,
}

impl AmplificationNotReady {
    pub fn label(self) -> &'static str {
        match self {
            Self::NotEnabled => "not-enabled",
            Self::SkipFlagSet => "skip-flag-set",
            Self::LodTooLow => "lod-too-low",
            Self::ArraySizeMismatch => "array-size-mismatch",
            Self::SerialDrifted => "serial-drifted",
        }
    }
}

#[derive(Debug, Error)]
pub enum LithosError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("triangulation backend failure: {0}")]
    BackendFailure(String),

    #[error("memory preflight rejected the request: {0}")]
    MemoryPressure(String),

    #[error("stage B amplification not ready ({})", .0.label())]
    AmplificationNotReady(AmplificationNotReady),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LithosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_reasons_have_stable_labels() {
        assert_eq!(AmplificationNotReady::LodTooLow.label(), "lod-too-low");
        assert_eq!(AmplificationNotReady::SerialDrifted.label(), "serial-drifted");
    }

    #[test]
    fn error_messages_carry_context() {
        let e = LithosError::BackendFailure("wheel produced 0 triangles".into());
        assert!(e.to_string().contains("wheel"));
        let e = LithosError::AmplificationNotReady(AmplificationNotReady::SkipFlagSet);
        assert!(e.to_string().contains("skip-flag-set"));
    }
}
