//! Triangulation caching.
//!
//! Two layers: a process-wide mutex-guarded map keyed on
//! `(backend, point hash, shuffle flags)` that short-circuits repeated
//! builds for unchanged inputs, and an on-disk bincode file keyed on
//! `(N, seed, shuffle)` whose triangle-set signature is re-verified on
//! load so a stale or tampered entry invalidates itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::Backend;
use crate::error::{LithosError, Result};
use crate::mesh::backend::{triangulate_with, TriangulationResult};
use crate::mesh::shuffle::{apply_permutation, remap_triangles, shuffled_permutation};
use crate::mesh::{canonicalize, hash_points, triangle_set_signature, Triangle};
use crate::sphere::Vec3;

// ── In-memory cache ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoryKey {
    backend: &'static str,
    points_hash: u64,
    shuffle: bool,
    shuffle_seed: u64,
}

#[derive(Clone)]
struct MemoryEntry {
    triangles: Arc<Vec<Triangle>>,
    backend_name: &'static str,
    used_fallback: bool,
}

fn memory_cache() -> &'static Mutex<HashMap<MemoryKey, MemoryEntry>> {
    static CACHE: OnceLock<Mutex<HashMap<MemoryKey, MemoryEntry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn backend_cache_name(backend: Backend) -> &'static str {
    match backend {
        Backend::Auto => "auto",
        Backend::Hull => "hull",
        Backend::Wheel => "wheel",
    }
}

/// Build a canonical triangulation, honouring the shuffle flags and the
/// process cache. Identical `(points, backend, shuffle, shuffle_seed)`
/// return bit-identical triangle sets across calls and runs.
pub fn build_triangulation(
    points: &[Vec3],
    backend: Backend,
    shuffle: bool,
    shuffle_seed: u64,
) -> Result<Arc<Vec<Triangle>>> {
    let key = MemoryKey {
        backend: backend_cache_name(backend),
        points_hash: hash_points(points),
        shuffle,
        shuffle_seed,
    };

    if let Some(entry) = memory_cache().lock().unwrap().get(&key) {
        debug!(
            "triangulation cache hit: backend={} fallback={} hash={:016x} shuffle={} seed={}",
            entry.backend_name, entry.used_fallback, key.points_hash, shuffle, shuffle_seed
        );
        return Ok(Arc::clone(&entry.triangles));
    }

    let result: TriangulationResult = if shuffle {
        let permutation = shuffled_permutation(points.len(), shuffle_seed);
        let shuffled = apply_permutation(points, &permutation);
        let mut result = triangulate_with(backend, &shuffled)?;
        remap_triangles(&mut result.triangles, &permutation);
        result.triangles = canonicalize(points, result.triangles);
        result
    } else {
        triangulate_with(backend, points)?
    };

    let triangles = Arc::new(result.triangles);
    memory_cache().lock().unwrap().insert(
        key,
        MemoryEntry {
            triangles: Arc::clone(&triangles),
            backend_name: result.backend_name,
            used_fallback: result.used_fallback,
        },
    );
    Ok(triangles)
}

// ── On-disk cache ─────────────────────────────────────────────────────────

const CACHE_MAGIC: u32 = 0x4C49_5452; // "LITR"
const CACHE_VERSION: u32 = 1;

/// Key and provenance of a cached triangulation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriangulationMeta {
    pub n: u32,
    pub seed: u64,
    pub shuffle: bool,
    /// FNV-1a signature of the canonical triangle set; 0 means unknown.
    pub signature: u64,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    magic: u32,
    version: u32,
    meta: TriangulationMeta,
    points: Vec<[f64; 3]>,
    triangles: Vec<[u32; 3]>,
}

fn cache_path(dir: &Path, meta: &TriangulationMeta) -> PathBuf {
    dir.join(format!(
        "fibonacci_{}_seed{}_shuffle{}.bin",
        meta.n,
        meta.seed,
        if meta.shuffle { 1 } else { 0 }
    ))
}

/// Persist a triangulation. The signature is recomputed from the canonical
/// set; a conflicting caller-supplied signature is overridden with a
/// warning.
pub fn save_to_disk(
    dir: &Path,
    meta: TriangulationMeta,
    points: &[Vec3],
    triangles: &[Triangle],
) -> Result<PathBuf> {
    if points.is_empty() || triangles.is_empty() {
        return Err(LithosError::DataUnavailable(
            "refusing to cache an empty triangulation".into(),
        ));
    }

    let canonical = canonicalize(points, triangles.to_vec());
    let computed = triangle_set_signature(&canonical);
    if meta.signature != 0 && meta.signature != computed {
        warn!(
            "triangulation signature mismatch on save: supplied={:016x} computed={:016x}; using computed",
            meta.signature, computed
        );
    }
    let meta = TriangulationMeta {
        n: points.len() as u32,
        signature: computed,
        ..meta
    };

    std::fs::create_dir_all(dir)?;
    let path = cache_path(dir, &meta);
    let file = CacheFile {
        magic: CACHE_MAGIC,
        version: CACHE_VERSION,
        meta,
        points: points.iter().map(|p| [p.x, p.y, p.z]).collect(),
        triangles: canonical.iter().map(|t| [t.v0, t.v1, t.v2]).collect(),
    };
    let bytes = bincode::serialize(&file)
        .map_err(|e| LithosError::DataUnavailable(format!("cache encode failed: {e}")))?;
    std::fs::write(&path, bytes)?;
    debug!(
        "saved triangulation cache: path={} points={} triangles={}",
        path.display(),
        points.len(),
        canonical.len()
    );
    Ok(path)
}

/// Load a cached triangulation matching `key`. Returns `Ok(None)` when the
/// file is missing or fails validation (magic, version, key fields, or the
/// recomputed triangle-set signature).
pub fn load_from_disk(
    dir: &Path,
    key: &TriangulationMeta,
) -> Result<Option<(Vec<Vec3>, Vec<Triangle>, TriangulationMeta)>> {
    let path = cache_path(dir, key);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file: CacheFile = match bincode::deserialize(&bytes) {
        Ok(f) => f,
        Err(e) => {
            warn!("triangulation cache unreadable: path={} error={e}", path.display());
            return Ok(None);
        }
    };

    if file.magic != CACHE_MAGIC || file.version != CACHE_VERSION {
        warn!(
            "triangulation cache header mismatch: path={} magic={:08x} version={}",
            path.display(),
            file.magic,
            file.version
        );
        return Ok(None);
    }
    if file.meta.n != key.n || file.meta.seed != key.seed || file.meta.shuffle != key.shuffle {
        warn!(
            "triangulation cache key mismatch: path={} file=({}, {}, {}) requested=({}, {}, {})",
            path.display(),
            file.meta.n,
            file.meta.seed,
            file.meta.shuffle,
            key.n,
            key.seed,
            key.shuffle
        );
        return Ok(None);
    }
    if file.points.len() != file.meta.n as usize {
        warn!(
            "triangulation cache length mismatch: path={} header N={} points={}",
            path.display(),
            file.meta.n,
            file.points.len()
        );
        return Ok(None);
    }

    let points: Vec<Vec3> = file.points.iter().map(|p| Vec3::new(p[0], p[1], p[2])).collect();
    let triangles: Vec<Triangle> = file
        .triangles
        .iter()
        .map(|t| Triangle::new(t[0], t[1], t[2]))
        .collect();
    let triangles = canonicalize(&points, triangles);

    let computed = triangle_set_signature(&triangles);
    if file.meta.signature != 0 && file.meta.signature != computed {
        warn!(
            "triangulation cache signature mismatch: path={} file={:016x} computed={:016x}",
            path.display(),
            file.meta.signature,
            computed
        );
        return Ok(None);
    }

    let meta = TriangulationMeta { signature: computed, ..file.meta };
    Ok(Some((points, triangles, meta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::fibonacci_sphere;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lithos-cache-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn memory_cache_returns_identical_sets() {
        let points = fibonacci_sphere(128);
        let a = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        let b = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second call should hit the cache");
    }

    #[test]
    fn shuffle_changes_nothing_after_canonicalisation() {
        let points = fibonacci_sphere(256);
        let plain = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        let shuffled = build_triangulation(&points, Backend::Auto, true, 99).unwrap();
        assert_eq!(
            triangle_set_signature(&plain),
            triangle_set_signature(&shuffled),
            "shuffle must not change the canonical edge set"
        );
    }

    #[test]
    fn disk_roundtrip_preserves_everything() {
        let dir = temp_dir("roundtrip");
        let points = fibonacci_sphere(64);
        let tris = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        let meta = TriangulationMeta { n: 64, seed: 42, shuffle: false, signature: 0 };
        save_to_disk(&dir, meta, &points, &tris).unwrap();

        let key = TriangulationMeta { n: 64, seed: 42, shuffle: false, signature: 0 };
        let (loaded_points, loaded_tris, loaded_meta) =
            load_from_disk(&dir, &key).unwrap().expect("cache entry should load");
        assert_eq!(loaded_points.len(), 64);
        assert_eq!(loaded_tris.as_slice(), tris.as_slice());
        assert_eq!(loaded_meta.signature, triangle_set_signature(&tris));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = temp_dir("missing");
        let key = TriangulationMeta { n: 12, seed: 1, shuffle: true, signature: 0 };
        assert!(load_from_disk(&dir, &key).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tampered_signature_invalidates_entry() {
        let dir = temp_dir("tamper");
        let points = fibonacci_sphere(64);
        let tris = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        let meta = TriangulationMeta { n: 64, seed: 7, shuffle: false, signature: 0 };
        let path = save_to_disk(&dir, meta, &points, &tris).unwrap();

        // Flip one byte in the triangle payload region.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let key = TriangulationMeta { n: 64, seed: 7, shuffle: false, signature: 0 };
        assert!(
            load_from_disk(&dir, &key).unwrap().is_none(),
            "tampered cache entry must not load"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn key_mismatch_invalidates_entry() {
        let dir = temp_dir("keymismatch");
        let points = fibonacci_sphere(64);
        let tris = build_triangulation(&points, Backend::Auto, false, 0).unwrap();
        save_to_disk(
            &dir,
            TriangulationMeta { n: 64, seed: 11, shuffle: false, signature: 0 },
            &points,
            &tris,
        )
        .unwrap();

        // Same filename key fields are part of the name, so fake a copy
        // under a different name to exercise the field check.
        let stored = cache_path(&dir, &TriangulationMeta { n: 64, seed: 11, shuffle: false, signature: 0 });
        let forged = cache_path(&dir, &TriangulationMeta { n: 64, seed: 12, shuffle: false, signature: 0 });
        std::fs::copy(&stored, &forged).unwrap();

        let key = TriangulationMeta { n: 64, seed: 12, shuffle: false, signature: 0 };
        assert!(load_from_disk(&dir, &key).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
