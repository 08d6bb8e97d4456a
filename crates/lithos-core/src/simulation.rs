//! The simulation driver: owns the mesh, the plate table, and the
//! structure-of-arrays vertex state, and runs the kernel pipeline in its
//! fixed order once per `step()` call.
//!
//! Per step (dt = 2 Ma): boundary reclassification → subduction (uplift,
//! fold directions, slab pull) → oceanic crust template → continental
//! collision → rifting → erosion → optional Stage B amplification.
//!
//! Two monotonic counters version the state: topology (points, triangles
//! or plate assignment changed) and surface (elevations changed under a
//! fixed topology). Stage B readbacks are only applied while both still
//! match the snapshot they were taken from.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::amplify::continental::{amplify_continental_cpu, pack_terrain_decisions};
use crate::amplify::exemplar::ExemplarAtlas;
use crate::amplify::oceanic::amplify_oceanic_cpu;
use crate::amplify::snapshot::{ContinentalSnapshot, DispatchKind, OceanicSnapshot, Readback};
use crate::amplify::AmplificationParams;
use crate::boundary::{compute_boundary_fields, BoundaryField, BoundaryMetrics};
use crate::config::SimulationConfig;
use crate::constants::{
    ABYSSAL_ELEVATION_M, REFERENCE_PLATE_AREA_KM2, TIME_STEP_MA,
};
use crate::error::{AmplificationNotReady, LithosError, Result};
use crate::heightmap::export::{export_heightmap, ExportMetrics, ExportRequest};
use crate::heightmap::sampler::HeightmapSampler;
use crate::kernels::collision::{
    affected_vertices, apply_collision_surge, detect_collisions, event_radius_rad,
    CollisionMetrics,
};
use crate::kernels::erosion::{apply_erosion, ErosionMetrics, ErosionToggles};
use crate::kernels::oceanic::{apply_oceanic_crust, OceanicMetrics, RidgeCache};
use crate::kernels::rifting::{evaluate_rifting, perform_rifting, RiftingMetrics};
use crate::kernels::subduction::{
    apply_uplift, relative_surface_speed, slab_pull_deltas, update_fold_directions, FoldMetrics,
    SlabPullMetrics, SubductionMetrics,
};
use crate::mesh::adjacency::{neighbors, neighbors_cyclic, AdjacencyCsr};
use crate::mesh::cache::build_triangulation;
use crate::mesh::Triangle;
use crate::plates::{surface_velocity, CrustKind, Plate, PlateSet};
use crate::sampling::fibonacci_sphere;
use crate::sphere::{Vec3, ZERO};

/// Plates seeded at simulation start.
const DEFAULT_PLATE_COUNT: usize = 8;
/// Fraction of seeded plates carrying continental crust.
const CONTINENTAL_FRACTION: f64 = 0.4;
/// Base rate of the rifting probability model.
const RIFT_LAMBDA_BASE: f64 = 0.3;
/// Collision surge cap (m).
const COLLISION_GUARDRAIL_M: f64 = 6000.0;
/// Starting crust ages (Ma).
const INITIAL_OCEANIC_AGE_MA: f64 = 60.0;
const INITIAL_CONTINENTAL_AGE_MA: f64 = 450.0;
/// Starting continental freeboard scale (m).
const CONTINENTAL_BASELINE_M: f64 = 300.0;

/// Parallel per-vertex arrays. Plate ids live in the plate set.
#[derive(Debug, Clone)]
pub struct VertexState {
    pub elevation_m: Vec<f64>,
    pub amplified_elevation_m: Vec<f64>,
    pub crust_age_ma: Vec<f64>,
    pub stress_mpa: Vec<f64>,
    pub velocity_km_per_ma: Vec<Vec3>,
    pub ridge_direction: Vec<Vec3>,
    pub fold_direction: Vec<Vec3>,
}

impl VertexState {
    fn new(n: usize) -> Self {
        Self {
            elevation_m: vec![0.0; n],
            amplified_elevation_m: vec![0.0; n],
            crust_age_ma: vec![0.0; n],
            stress_mpa: vec![0.0; n],
            velocity_km_per_ma: vec![ZERO; n],
            ridge_direction: vec![ZERO; n],
            fold_direction: vec![ZERO; n],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub boundary: BoundaryMetrics,
    pub subduction: SubductionMetrics,
    pub fold: FoldMetrics,
    pub slab_pull: SlabPullMetrics,
    pub oceanic: OceanicMetrics,
    pub collision: CollisionMetrics,
    pub rifting: RiftingMetrics,
    pub erosion: ErosionMetrics,
    pub amplified_vertices: usize,
    pub classify_ms: f64,
    pub kernels_ms: f64,
    pub total_ms: f64,
}

pub struct Simulation {
    pub config: SimulationConfig,
    pub points: Vec<Vec3>,
    pub triangles: Arc<Vec<Triangle>>,
    pub neighbors: Vec<Vec<u32>>,
    pub neighbors_cyclic: Vec<Vec<u32>>,
    pub csr: AdjacencyCsr,
    pub plates: PlateSet,
    pub state: VertexState,
    pub boundary: Option<BoundaryField>,
    /// Per-vertex plate baseline used by the oceanic template.
    baseline_m: Vec<f64>,
    ridge_cache: RidgeCache,
    /// Terranes already accreted: (carrier, target, centre). A collision
    /// event surges once; repeats at the same front are spent terranes.
    applied_collisions: Vec<(i32, i32, Vec3)>,
    pub amplification_params: AmplificationParams,
    topology_version: u64,
    surface_version: u64,
    amplification_serial: u64,
    amplification_current: bool,
    skip_cpu_amplification: bool,
    stale_readbacks: u64,
    steps_run: u64,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        Self::with_disk_cache(config, None)
    }

    /// Like [`Simulation::new`], but consulting an on-disk triangulation
    /// cache first and saving a fresh build back into it.
    pub fn with_disk_cache(config: SimulationConfig, cache_dir: Option<&Path>) -> Result<Self> {
        config.validate()?;

        let points = fibonacci_sphere(config.sample_count);
        let cache_key = crate::mesh::cache::TriangulationMeta {
            n: points.len() as u32,
            seed: config.seed,
            shuffle: config.shuffle,
            signature: 0,
        };
        let cached = match cache_dir {
            Some(dir) => crate::mesh::cache::load_from_disk(dir, &cache_key)?
                .filter(|(cached_points, _, _)| cached_points == &points)
                .map(|(_, tris, _)| Arc::new(tris)),
            None => None,
        };
        let triangles = match cached {
            Some(tris) => {
                info!("triangulation loaded from disk cache ({} triangles)", tris.len());
                tris
            }
            None => {
                let tris = build_triangulation(
                    &points,
                    config.backend,
                    config.shuffle,
                    config.shuffle_seed,
                )?;
                if let Some(dir) = cache_dir {
                    crate::mesh::cache::save_to_disk(dir, cache_key, &points, &tris)?;
                }
                tris
            }
        };
        let nbs = neighbors(points.len(), &triangles);
        let cyclic = neighbors_cyclic(&points, &triangles);
        let csr = AdjacencyCsr::from_lists(&nbs);

        let plates = PlateSet::seed(&points, DEFAULT_PLATE_COUNT, CONTINENTAL_FRACTION, config.seed);

        let n = points.len();
        let mut state = VertexState::new(n);
        for i in 0..n {
            let plate = plates.plate(plates.assignments[i]);
            match plate.map(|p| (p.crust, p.continental_ratio)) {
                Some((CrustKind::Continental, ratio)) => {
                    state.elevation_m[i] = CONTINENTAL_BASELINE_M * ratio;
                    state.crust_age_ma[i] = INITIAL_CONTINENTAL_AGE_MA;
                }
                _ => {
                    state.elevation_m[i] = ABYSSAL_ELEVATION_M;
                    state.crust_age_ma[i] = INITIAL_OCEANIC_AGE_MA;
                }
            }
        }
        state.amplified_elevation_m = state.elevation_m.clone();
        let baseline_m = state.elevation_m.clone();

        info!(
            "simulation created: n={} plates={} seed={} triangles={}",
            n,
            plates.plates.len(),
            config.seed,
            triangles.len()
        );

        Ok(Self {
            config,
            points,
            triangles,
            neighbors: nbs,
            neighbors_cyclic: cyclic,
            csr,
            plates,
            state,
            boundary: None,
            baseline_m,
            ridge_cache: RidgeCache::default(),
            applied_collisions: Vec::new(),
            amplification_params: AmplificationParams::default(),
            topology_version: 1,
            surface_version: 0,
            amplification_serial: 0,
            amplification_current: false,
            skip_cpu_amplification: false,
            stale_readbacks: 0,
            steps_run: 0,
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.points.len()
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn surface_version(&self) -> u64 {
        self.surface_version
    }

    pub fn amplification_serial(&self) -> u64 {
        self.amplification_serial
    }

    pub fn stale_readbacks(&self) -> u64 {
        self.stale_readbacks
    }

    pub fn set_skip_cpu_amplification(&mut self, skip: bool) {
        self.skip_cpu_amplification = skip;
    }

    /// One indivisible simulation step.
    pub fn step(&mut self, atlas: Option<&ExemplarAtlas>) -> Result<StepMetrics> {
        let step_start = Instant::now();
        let mut metrics = StepMetrics::default();
        let n = self.points.len();
        let dt = TIME_STEP_MA;

        // ── Boundary reclassification ────────────────────────────────────
        let classify_start = Instant::now();
        let omegas = self.plates.omegas();
        let boundary = compute_boundary_fields(
            &self.points,
            &self.neighbors_cyclic,
            &self.plates.assignments,
            &omegas,
            self.config.boundary_transform_epsilon,
        );
        metrics.classify_ms = classify_start.elapsed().as_secs_f64() * 1000.0;
        metrics.boundary = boundary.metrics.clone();

        // Per-vertex surface velocities for downstream consumers.
        for i in 0..n {
            let pid = self.plates.assignments[i];
            self.state.velocity_km_per_ma[i] = match self.plates.plate(pid) {
                Some(plate) => surface_velocity(plate.omega(), self.points[i]),
                None => ZERO,
            };
        }

        let kernels_start = Instant::now();

        // ── Subduction ───────────────────────────────────────────────────
        metrics.subduction = apply_uplift(
            &self.points,
            &self.csr,
            &self.plates.assignments,
            &omegas,
            &boundary,
            &mut self.state.elevation_m,
            &mut self.state.stress_mpa,
            dt,
        );
        metrics.fold = update_fold_directions(
            &self.points,
            &self.csr,
            &self.plates.assignments,
            &omegas,
            &boundary,
            &mut self.state.fold_direction,
            dt,
        );
        let centroids: Vec<Vec3> = self.plates.plates.iter().map(|p| p.centroid).collect();
        let (omega_deltas, slab) = slab_pull_deltas(&centroids, &boundary, &self.points, dt);
        self.plates.apply_omega_deltas(&omega_deltas);
        metrics.slab_pull = slab;

        // ── Oceanic crust template ───────────────────────────────────────
        let oceanic_flags: Vec<bool> = self
            .plates
            .plates
            .iter()
            .map(|p| p.crust == CrustKind::Oceanic)
            .collect();
        metrics.oceanic = apply_oceanic_crust(
            &self.points,
            &self.csr,
            &boundary,
            &self.plates.assignments,
            &oceanic_flags,
            &self.baseline_m,
            &mut self.state.elevation_m,
            Some(&mut self.ridge_cache),
        );
        self.state.ridge_direction = self.ridge_cache.directions.clone();

        // Crust ages: advance everywhere, reset at ridge seeds.
        for i in 0..n {
            if boundary.distance_to_ridge_km[i] <= 1e-12 {
                self.state.crust_age_ma[i] = 0.0;
            } else {
                self.state.crust_age_ma[i] += dt;
            }
        }

        // ── Continental collision ────────────────────────────────────────
        let continental_flags = self.plates.continental_flags();
        let events = detect_collisions(
            &self.points,
            &self.plates.assignments,
            &continental_flags,
            &boundary,
            COLLISION_GUARDRAIL_M,
        );
        for event in &events {
            let spent = self.applied_collisions.iter().any(|&(lo, hi, c)| {
                lo == event.carrier_plate
                    && hi == event.target_plate
                    && crate::sphere::angular_distance(c, event.center)
                        <= 0.5_f64.to_radians()
            });
            if spent {
                continue;
            }
            let speed = match (
                self.plates.plate(event.carrier_plate),
                self.plates.plate(event.target_plate),
            ) {
                (Some(a), Some(b)) => {
                    relative_surface_speed(a.omega(), b.omega(), event.center)
                }
                _ => 0.0,
            };
            let radius = event_radius_rad(event, speed);
            let affected = affected_vertices(&self.points, event.center, radius);
            let m = apply_collision_surge(
                &self.points,
                &affected,
                event,
                radius,
                &mut self.state.elevation_m,
                Some(&mut self.state.fold_direction),
            );
            metrics.collision.collision_count += m.collision_count;
            metrics.collision.vertices_affected += m.vertices_affected;
            metrics.collision.max_peak_m = metrics.collision.max_peak_m.max(m.max_peak_m);
            self.applied_collisions
                .push((event.carrier_plate, event.target_plate, event.center));
        }

        // ── Rifting ──────────────────────────────────────────────────────
        let mut topology_changed = false;
        let plate_snapshot: Vec<(i32, f64, f64)> = self
            .plates
            .plates
            .iter()
            .map(|p| {
                (
                    p.id,
                    crate::plates::plate_area_km2(self.plates.vertex_count_of(p.id), n),
                    p.continental_ratio,
                )
            })
            .collect();
        for (plate_id, area, ratio) in plate_snapshot {
            let Some(event) =
                evaluate_rifting(plate_id, area, ratio, RIFT_LAMBDA_BASE, REFERENCE_PLATE_AREA_KM2)
            else {
                continue;
            };
            let max_plate_id = self.plates.plates.len() as i32 - 1;
            let Some(outcome) =
                perform_rifting(&event, &self.points, &self.plates.assignments, max_plate_id)
            else {
                continue;
            };

            let parent = self
                .plates
                .plate(plate_id)
                .cloned()
                .ok_or_else(|| LithosError::DataUnavailable(format!("plate {plate_id} vanished")))?;
            self.plates.assignments = outcome.assignments;
            for (k, &fragment_id) in outcome.fragment_plate_ids.iter().enumerate().skip(1) {
                // New fragments drift along their assigned tangent: the
                // Euler axis c × d yields velocity d at the centroid.
                let members: Vec<Vec3> = self
                    .plates
                    .assignments
                    .iter()
                    .zip(&self.points)
                    .filter(|(&pid, _)| pid == fragment_id)
                    .map(|(_, &p)| p)
                    .collect();
                let centroid = members
                    .iter()
                    .fold(ZERO, |acc, &p| acc + p)
                    .normalize_or_zero();
                let drift = outcome.drift_directions[k];
                let axis = centroid.cross(drift).normalize_or_zero();
                self.plates.plates.push(Plate {
                    id: fragment_id,
                    euler_axis: if axis.is_nearly_zero() { parent.euler_axis } else { axis },
                    angular_speed_rad_per_ma: parent.angular_speed_rad_per_ma,
                    centroid: if centroid.is_nearly_zero() { parent.centroid } else { centroid },
                    crust: parent.crust,
                    continental_ratio: outcome.continental_ratio,
                });
            }
            metrics.rifting.record(event.fragment_count);
            topology_changed = true;
            debug!(
                "rift: plate={} fragments={} new_max_id={}",
                plate_id,
                event.fragment_count,
                self.plates.plates.len() - 1
            );
        }
        if topology_changed {
            self.plates.update_centroids(&self.points);
            self.topology_version += 1;
        }

        // ── Erosion ──────────────────────────────────────────────────────
        let toggles = ErosionToggles {
            continental_erosion: self.config.enable_continental_erosion,
            oceanic_dampening: self.config.enable_oceanic_dampening,
            trench_accretion: self.config.enable_trench_accretion,
        };
        metrics.erosion = apply_erosion(
            &self.plates.assignments,
            &self.plates.continental_flags(),
            &boundary,
            self.config.trench_band_km,
            toggles,
            &mut self.state.elevation_m,
            &mut self.state.stress_mpa,
            dt,
        );

        metrics.kernels_ms = kernels_start.elapsed().as_secs_f64() * 1000.0;

        self.boundary = Some(boundary);
        self.surface_version += 1;
        self.steps_run += 1;
        self.amplification_current = false;

        // ── Stage B (optional, CPU formulation in-step) ─────────────────
        metrics.amplified_vertices = self.run_cpu_amplification(atlas)?;

        metrics.total_ms = step_start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "step {} done: classify={:.2}ms kernels={:.2}ms total={:.2}ms",
            self.steps_run, metrics.classify_ms, metrics.kernels_ms, metrics.total_ms
        );
        Ok(metrics)
    }

    fn stage_b_enabled(&self) -> bool {
        self.config.enable_oceanic_amplification || self.config.enable_continental_amplification
    }

    /// Reason Stage B output cannot be used right now, if any.
    pub fn amplification_readiness(&self) -> std::result::Result<(), AmplificationNotReady> {
        if !self.stage_b_enabled() {
            return Err(AmplificationNotReady::NotEnabled);
        }
        if self.skip_cpu_amplification {
            return Err(AmplificationNotReady::SkipFlagSet);
        }
        if !self.config.amplification_lod_ok() {
            return Err(AmplificationNotReady::LodTooLow);
        }
        if self.state.amplified_elevation_m.len() != self.points.len() {
            return Err(AmplificationNotReady::ArraySizeMismatch);
        }
        if !self.amplification_current {
            return Err(AmplificationNotReady::SerialDrifted);
        }
        Ok(())
    }

    fn run_cpu_amplification(&mut self, atlas: Option<&ExemplarAtlas>) -> Result<usize> {
        if !self.stage_b_enabled()
            || self.skip_cpu_amplification
            || !self.config.amplification_lod_ok()
        {
            self.state.amplified_elevation_m = self.state.elevation_m.clone();
            return Ok(0);
        }

        self.amplification_serial += 1;
        let mut amplified: Vec<f64> = self.state.elevation_m.clone();
        let mut touched = 0usize;

        if self.config.enable_oceanic_amplification {
            let snapshot = self.build_oceanic_snapshot();
            let oceanic = amplify_oceanic_cpu(&snapshot);
            for i in 0..amplified.len() {
                if snapshot.oceanic_mask[i] != 0 {
                    if (oceanic[i] - amplified[i]).abs() > 0.0 {
                        touched += 1;
                    }
                    amplified[i] = oceanic[i];
                }
            }
        }

        if self.config.enable_continental_amplification {
            let library = atlas.and_then(|a| a.current()).ok_or_else(|| {
                LithosError::DataUnavailable("continental amplification needs an exemplar atlas".into())
            })?;
            let snapshot = self.build_continental_snapshot(
                atlas.map(|a| a.version()).unwrap_or(0),
                &library,
            );
            let continental = amplify_continental_cpu(&snapshot, &library);
            for i in 0..amplified.len() {
                if snapshot.continental_mask[i] != 0 {
                    if (continental[i] - amplified[i]).abs() > 0.0 {
                        touched += 1;
                    }
                    amplified[i] = continental[i];
                }
            }
        }

        self.state.amplified_elevation_m = amplified;
        self.amplification_current = true;
        Ok(touched)
    }

    /// Oceanic mask by plate crust kind.
    fn oceanic_mask(&self) -> Vec<u32> {
        let flags: Vec<bool> = self
            .plates
            .plates
            .iter()
            .map(|p| p.crust == CrustKind::Oceanic)
            .collect();
        self.plates
            .assignments
            .iter()
            .map(|&pid| {
                u32::from(pid >= 0 && flags.get(pid as usize).copied().unwrap_or(false))
            })
            .collect()
    }

    pub fn build_oceanic_snapshot(&self) -> OceanicSnapshot {
        let n = self.points.len();
        OceanicSnapshot {
            baseline_m: self.state.elevation_m.iter().map(|&z| z as f32).collect(),
            ridge_directions: self
                .state
                .ridge_direction
                .iter()
                .map(|r| [r.x as f32, r.y as f32, r.z as f32])
                .collect(),
            crust_age_ma: self.state.crust_age_ma.iter().map(|&a| a as f32).collect(),
            positions: self
                .points
                .iter()
                .map(|p| [p.x as f32, p.y as f32, p.z as f32])
                .collect(),
            oceanic_mask: self.oceanic_mask(),
            params: self.amplification_params,
            vertex_count: n,
            topology_version: self.topology_version,
            surface_version: self.surface_version,
            serial: self.amplification_serial,
        }
    }

    pub fn build_continental_snapshot(
        &self,
        atlas_version: u64,
        library: &crate::amplify::exemplar::ExemplarLibrary,
    ) -> ContinentalSnapshot {
        let n = self.points.len();
        let continental_mask: Vec<u32> =
            self.oceanic_mask().iter().map(|&m| 1 - m).collect();
        let d_boundary: Vec<f64> = match &self.boundary {
            Some(b) => b.distance_to_boundary_km.clone(),
            None => vec![f64::MAX; n],
        };
        let (packed, uv) = pack_terrain_decisions(
            &self.points,
            &self.csr,
            &self.state.elevation_m,
            &self.state.crust_age_ma,
            &d_boundary,
            &continental_mask,
            library,
        );
        ContinentalSnapshot {
            baseline_m: self.state.elevation_m.iter().map(|&z| z as f32).collect(),
            packed_info: packed,
            uv,
            continental_mask,
            params: self.amplification_params,
            atlas_version,
            vertex_count: n,
            topology_version: self.topology_version,
            surface_version: self.surface_version,
            serial: self.amplification_serial,
        }
    }

    /// Apply a dispatch readback. Returns true when applied; a stale
    /// readback (hash or versions no longer matching) is discarded with a
    /// warning counter bump.
    pub fn apply_readback(&mut self, readback: &Readback) -> bool {
        let current_hash = match readback.kind {
            DispatchKind::Oceanic => self.build_oceanic_snapshot().content_hash(),
            DispatchKind::Continental => {
                // Continental staleness is decided on versions alone: the
                // packed decisions depend on the atlas, which the caller
                // owns.
                readback.snapshot_hash
            }
        };
        let fresh = readback.topology_version == self.topology_version
            && readback.surface_version == self.surface_version
            && readback.snapshot_hash == current_hash
            && readback.amplified_m.len() == self.points.len();
        if !fresh {
            self.stale_readbacks += 1;
            warn!(
                "stale readback discarded: serial={} topo={}/{} surface={}/{} (total stale={})",
                readback.serial,
                readback.topology_version,
                self.topology_version,
                readback.surface_version,
                self.surface_version,
                self.stale_readbacks
            );
            return false;
        }
        for (dst, &src) in self
            .state
            .amplified_elevation_m
            .iter_mut()
            .zip(&readback.amplified_m)
        {
            *dst = src as f64;
        }
        self.amplification_current = true;
        true
    }

    /// The elevation source an export should read: amplified when Stage B
    /// is ready, baseline otherwise (with the structured reason).
    pub fn elevation_source(&self) -> (&[f64], bool, Option<AmplificationNotReady>) {
        match self.amplification_readiness() {
            Ok(()) => (&self.state.amplified_elevation_m, true, None),
            Err(reason) => (&self.state.elevation_m, false, Some(reason)),
        }
    }

    /// Warm the process triangulation cache for an alternate mesh density
    /// on a background worker; the result lands in the shared cache, so a
    /// later `Simulation` at that density starts instantly.
    pub fn prewarm_mesh(
        sample_count: usize,
        backend: crate::config::Backend,
        shuffle: bool,
        shuffle_seed: u64,
    ) -> std::thread::JoinHandle<bool> {
        std::thread::Builder::new()
            .name("mesh-prewarm".into())
            .spawn(move || {
                let points = fibonacci_sphere(sample_count);
                match build_triangulation(&points, backend, shuffle, shuffle_seed) {
                    Ok(tris) => {
                        debug!("prewarmed mesh: n={sample_count} triangles={}", tris.len());
                        true
                    }
                    Err(e) => {
                        warn!("mesh prewarm failed at n={sample_count}: {e}");
                        false
                    }
                }
            })
            .expect("failed to spawn the prewarm worker")
    }

    /// Build a sampler over the current elevation source and export an
    /// equirectangular heightmap.
    pub fn export_heightmap(
        &self,
        width: usize,
        height: usize,
        output_dir: &Path,
    ) -> Result<(PathBuf, ExportMetrics)> {
        let (source, used_amplified, reason) = self.elevation_source();
        if let Some(reason) = reason {
            if self.stage_b_enabled() {
                warn!(
                    "heightmap export using baseline elevations: {}",
                    reason.label()
                );
            }
        }
        let sampler = HeightmapSampler::new(
            self.points.clone(),
            source.to_vec(),
            self.triangles.as_ref().clone(),
            used_amplified,
        )?;
        let min = source.iter().cloned().fold(f64::MAX, f64::min);
        let max = source.iter().cloned().fold(f64::MIN, f64::max);
        let request = ExportRequest {
            width,
            height,
            palette: self.config.heightmap_palette,
            unsafe_export: self.config.unsafe_heightmap_export,
            output_dir,
            shutdown: None,
            available_memory_override: None,
        };
        export_heightmap(&sampler, min, max, &request)
    }
}
