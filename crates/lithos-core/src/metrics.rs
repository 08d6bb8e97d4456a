//! Validation summary JSON.
//!
//! Every physics phase and every export can emit a
//! `summary_YYYYMMDD_HHMMSS.json` (UTC) carrying the same envelope:
//! phase, backend, sample count, seed, git commit, a phase-specific
//! metrics object, and a timing object in milliseconds.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use log::info;
use serde_json::{json, Value};

use crate::error::Result;

/// Short git hash of the working tree, empty when unavailable.
pub fn git_commit_hash() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Write a summary file into `dir` and return its path.
pub fn write_summary(
    dir: &Path,
    phase: &str,
    backend: &str,
    sample_count: usize,
    seed: u64,
    metrics: Value,
    timing_ms: Value,
) -> Result<PathBuf> {
    let root = json!({
        "phase": phase,
        "backend": backend,
        "sample_count": sample_count,
        "seed": seed,
        "git_commit": git_commit_hash(),
        "metrics": metrics,
        "timing_ms": timing_ms,
    });

    std::fs::create_dir_all(dir)?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("summary_{timestamp}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(&root)?)?;
    info!("validation summary written: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("lithos-metrics-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn summary_carries_the_envelope_and_utc_filename() {
        let dir = temp_dir("envelope");
        let path = write_summary(
            &dir,
            "3-subduction",
            "hull",
            10_000,
            42,
            json!({"vertices_uplifted": 123, "max_uplift_m": 4.5}),
            json!({"total": 12.0, "uplift": 7.0}),
        )
        .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("summary_") && name.ends_with(".json"));
        // summary_YYYYMMDD_HHMMSS.json
        assert_eq!(name.len(), "summary_".len() + 15 + ".json".len());

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["phase"], "3-subduction");
        assert_eq!(parsed["backend"], "hull");
        assert_eq!(parsed["sample_count"], 10_000);
        assert_eq!(parsed["seed"], 42);
        assert!(parsed["git_commit"].is_string());
        assert_eq!(parsed["metrics"]["vertices_uplifted"], 123);
        assert_eq!(parsed["timing_ms"]["total"], 12.0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
