//! Stage B input snapshots and the dispatch ring.
//!
//! A snapshot freezes everything an amplification pass reads (baseline,
//! directions, ages, positions, masks, parameters) together with the
//! topology/surface versions and a monotonically increasing serial. The
//! content hash travels with the readback: a readback whose hash or
//! versions no longer match current state is stale and must be dropped.
//!
//! Dispatches are modelled as a request → readback pair over bounded
//! single-producer/single-consumer channels; the producer blocks when no
//! slot is free.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::amplify::continental::{amplify_continental_f32, PackedTerrainInfo};
use crate::amplify::exemplar::ExemplarLibrary;
use crate::amplify::oceanic::amplify_oceanic_f32;
use crate::amplify::AmplificationParams;
use crate::mesh::fnv1a;

const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;

fn hash_f32s(hash: u64, values: &[f32]) -> u64 {
    let mut h = hash;
    for v in values {
        h = fnv1a(h, &v.to_bits().to_le_bytes());
    }
    h
}

fn hash_u32s(hash: u64, values: &[u32]) -> u64 {
    let mut h = hash;
    for v in values {
        h = fnv1a(h, &v.to_le_bytes());
    }
    h
}

/// Frozen inputs of an oceanic amplification pass.
#[derive(Debug, Clone)]
pub struct OceanicSnapshot {
    pub baseline_m: Vec<f32>,
    /// Unit tangent per vertex; zero when unset.
    pub ridge_directions: Vec<[f32; 3]>,
    pub crust_age_ma: Vec<f32>,
    pub positions: Vec<[f32; 3]>,
    /// 1 = oceanic.
    pub oceanic_mask: Vec<u32>,
    pub params: AmplificationParams,
    pub vertex_count: usize,
    pub topology_version: u64,
    pub surface_version: u64,
    pub serial: u64,
}

impl OceanicSnapshot {
    pub fn is_consistent(&self) -> bool {
        let n = self.vertex_count;
        self.baseline_m.len() == n
            && self.ridge_directions.len() == n
            && self.crust_age_ma.len() == n
            && self.positions.len() == n
            && self.oceanic_mask.len() == n
    }

    /// FNV-1a over every input buffer plus the parameters and count.
    pub fn content_hash(&self) -> u64 {
        if !self.is_consistent() {
            return 0;
        }
        let mut h = FNV_OFFSET;
        h = hash_f32s(h, &self.baseline_m);
        for d in &self.ridge_directions {
            h = hash_f32s(h, d);
        }
        h = hash_f32s(h, &self.crust_age_ma);
        for p in &self.positions {
            h = hash_f32s(h, p);
        }
        h = hash_u32s(h, &self.oceanic_mask);
        h = hash_f32s(
            h,
            &[
                self.params.ridge_amplitude_m,
                self.params.fault_frequency,
                self.params.age_falloff_ma,
                self.params.continental_relief_gain,
            ],
        );
        h = hash_u32s(h, &[self.params.noise_seed, self.vertex_count as u32]);
        h
    }
}

/// Frozen inputs of a continental amplification pass. Terrain selection
/// is resolved at snapshot time into packed per-vertex records so both
/// formulations consume identical decisions.
#[derive(Debug, Clone)]
pub struct ContinentalSnapshot {
    pub baseline_m: Vec<f32>,
    pub packed_info: Vec<PackedTerrainInfo>,
    pub uv: Vec<[f32; 2]>,
    /// 1 = continental.
    pub continental_mask: Vec<u32>,
    pub params: AmplificationParams,
    /// Atlas version the packed indices refer to.
    pub atlas_version: u64,
    pub vertex_count: usize,
    pub topology_version: u64,
    pub surface_version: u64,
    pub serial: u64,
}

impl ContinentalSnapshot {
    pub fn is_consistent(&self) -> bool {
        let n = self.vertex_count;
        self.baseline_m.len() == n
            && self.packed_info.len() == n
            && self.uv.len() == n
            && self.continental_mask.len() == n
    }

    pub fn content_hash(&self) -> u64 {
        if !self.is_consistent() {
            return 0;
        }
        let mut h = FNV_OFFSET;
        h = hash_f32s(h, &self.baseline_m);
        for info in &self.packed_info {
            h = hash_u32s(h, &info.0);
        }
        for uv in &self.uv {
            h = hash_f32s(h, uv);
        }
        h = hash_u32s(h, &self.continental_mask);
        h = hash_f32s(
            h,
            &[
                self.params.ridge_amplitude_m,
                self.params.fault_frequency,
                self.params.age_falloff_ma,
                self.params.continental_relief_gain,
            ],
        );
        h = hash_u32s(
            h,
            &[
                self.params.noise_seed,
                self.vertex_count as u32,
                self.atlas_version as u32,
            ],
        );
        h
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Oceanic,
    Continental,
}

enum Request {
    Oceanic(Arc<OceanicSnapshot>),
    Continental(Arc<ContinentalSnapshot>, Arc<ExemplarLibrary>),
    Shutdown,
}

/// A completed dispatch: the amplified buffer plus everything needed to
/// reject it if the simulation moved on.
pub struct Readback {
    pub kind: DispatchKind,
    pub serial: u64,
    pub snapshot_hash: u64,
    pub topology_version: u64,
    pub surface_version: u64,
    pub amplified_m: Vec<f32>,
}

/// Bounded request/readback ring with one worker thread. Submitting when
/// every slot is occupied blocks the producer (backpressure); dropping
/// the ring shuts the worker down cooperatively.
pub struct DispatchRing {
    requests: Sender<Request>,
    readbacks: Receiver<Readback>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchRing {
    pub fn new(capacity: usize) -> Self {
        let (req_tx, req_rx) = bounded::<Request>(capacity.max(1));
        let (rb_tx, rb_rx) = bounded::<Readback>(capacity.max(1));

        let worker = std::thread::Builder::new()
            .name("stageb-dispatch".into())
            .spawn(move || {
                while let Ok(request) = req_rx.recv() {
                    let readback = match request {
                        Request::Shutdown => break,
                        Request::Oceanic(snapshot) => Readback {
                            kind: DispatchKind::Oceanic,
                            serial: snapshot.serial,
                            snapshot_hash: snapshot.content_hash(),
                            topology_version: snapshot.topology_version,
                            surface_version: snapshot.surface_version,
                            amplified_m: amplify_oceanic_f32(&snapshot),
                        },
                        Request::Continental(snapshot, library) => Readback {
                            kind: DispatchKind::Continental,
                            serial: snapshot.serial,
                            snapshot_hash: snapshot.content_hash(),
                            topology_version: snapshot.topology_version,
                            surface_version: snapshot.surface_version,
                            amplified_m: amplify_continental_f32(&snapshot, &library),
                        },
                    };
                    if rb_tx.send(readback).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn the dispatch worker");

        Self {
            requests: req_tx,
            readbacks: rb_rx,
            worker: Some(worker),
        }
    }

    /// Queue an oceanic pass; blocks while the ring is full.
    pub fn submit_oceanic(&self, snapshot: Arc<OceanicSnapshot>) {
        let _ = self.requests.send(Request::Oceanic(snapshot));
    }

    /// Queue a continental pass; blocks while the ring is full.
    pub fn submit_continental(
        &self,
        snapshot: Arc<ContinentalSnapshot>,
        library: Arc<ExemplarLibrary>,
    ) {
        let _ = self.requests.send(Request::Continental(snapshot, library));
    }

    /// Non-blocking poll, for tick-style callers.
    pub fn try_poll(&self) -> Option<Readback> {
        self.readbacks.try_recv().ok()
    }

    /// Block until the next readback arrives (tests and the exporter).
    pub fn drain_one(&self) -> Option<Readback> {
        self.readbacks.recv().ok()
    }
}

impl Drop for DispatchRing {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            debug!("joining stage B dispatch worker");
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_oceanic_snapshot() -> OceanicSnapshot {
        OceanicSnapshot {
            baseline_m: vec![-4000.0, -5000.0],
            ridge_directions: vec![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
            crust_age_ma: vec![10.0, 80.0],
            positions: vec![[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]],
            oceanic_mask: vec![1, 1],
            params: AmplificationParams::default(),
            vertex_count: 2,
            topology_version: 1,
            surface_version: 3,
            serial: 7,
        }
    }

    #[test]
    fn hash_tracks_content() {
        let a = tiny_oceanic_snapshot();
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());
        b.crust_age_ma[1] += 1.0;
        assert_ne!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.params.noise_seed ^= 1;
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn inconsistent_snapshot_hashes_to_zero() {
        let mut s = tiny_oceanic_snapshot();
        s.baseline_m.pop();
        assert!(!s.is_consistent());
        assert_eq!(s.content_hash(), 0);
    }

    #[test]
    fn ring_round_trips_a_request() {
        let ring = DispatchRing::new(2);
        let snapshot = Arc::new(tiny_oceanic_snapshot());
        ring.submit_oceanic(Arc::clone(&snapshot));
        let readback = ring.drain_one().expect("worker must answer");
        assert_eq!(readback.kind, DispatchKind::Oceanic);
        assert_eq!(readback.serial, 7);
        assert_eq!(readback.snapshot_hash, snapshot.content_hash());
        assert_eq!(readback.amplified_m.len(), 2);
    }

    #[test]
    fn ring_preserves_submission_order() {
        let ring = DispatchRing::new(2);
        let mut first = tiny_oceanic_snapshot();
        first.serial = 1;
        let mut second = tiny_oceanic_snapshot();
        second.serial = 2;
        ring.submit_oceanic(Arc::new(first));
        ring.submit_oceanic(Arc::new(second));
        assert_eq!(ring.drain_one().unwrap().serial, 1);
        assert_eq!(ring.drain_one().unwrap().serial, 2);
    }
}
