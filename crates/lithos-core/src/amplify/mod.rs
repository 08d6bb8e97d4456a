//! Stage B amplification: layers high-frequency detail on top of the
//! baseline elevation field. Oceanic vertices get procedural fault fabric
//! keyed by ridge direction and crust age; continental vertices get a
//! weighted blend of exemplar heightfield patches.
//!
//! Every kernel exists in two formulations: the in-thread CPU path and a
//! dispatch path that runs the same mathematics in f32 on a worker behind
//! a bounded request/readback ring. The two must agree within 0.1 m per
//! vertex for identical snapshots.

pub mod continental;
pub mod exemplar;
pub mod oceanic;
pub mod snapshot;

use serde::{Deserialize, Serialize};

/// Tunables shared by both Stage B kernels. Hashed as part of every
/// snapshot, so changing any field invalidates in-flight dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmplificationParams {
    /// Peak oceanic fault relief at zero crust age (m).
    pub ridge_amplitude_m: f32,
    /// Angular frequency of the fault banding.
    pub fault_frequency: f32,
    /// Crust-age e-folding scale for the fault amplitude (Ma).
    pub age_falloff_ma: f32,
    /// Scale applied to blended continental exemplar relief.
    pub continental_relief_gain: f32,
    /// Seed for the gradient-noise phases.
    pub noise_seed: u32,
}

impl Default for AmplificationParams {
    fn default() -> Self {
        Self {
            ridge_amplitude_m: 150.0,
            fault_frequency: 40.0,
            age_falloff_ma: 120.0,
            continental_relief_gain: 0.35,
            noise_seed: 0x5EED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_roundtrip_through_json() {
        let p = AmplificationParams::default();
        let text = serde_json::to_string(&p).unwrap();
        let q: AmplificationParams = serde_json::from_str(&text).unwrap();
        assert_eq!(p, q);
    }
}
