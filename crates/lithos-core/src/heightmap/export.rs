//! Overlap-tiled equirectangular heightmap export.
//!
//! The image is rasterised in 512² tiles whose sample windows extend two
//! pixels past their core; only core pixels are stitched into the
//! destination. Misses climb a rescue ladder (sanitised UV, directional
//! nudges, expanded neighbourhood, seam wrap, clamped hints, row reuse),
//! every rung tallied separately. Per-row seam hints chain tiles together
//! and a post-fix pass reconciles tile-border rows whose redundant samples
//! disagree: if a retry cannot close the gap the right side adopts the
//! left value and the row is tagged as forced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::PaletteMode;
use crate::error::{LithosError, Result};
use crate::heightmap::palette::HeightmapPalette;
use crate::heightmap::sampler::{HeightmapSampler, SampleInfo, NO_TRIANGLE, POLE_AVOIDANCE_EPSILON};

pub const TILE_SIZE: usize = 512;
pub const TILE_OVERLAP: usize = 2;
pub const SEAM_TOLERANCE_M: f64 = 0.5;

/// Advisory wall-clock budgets; exceeding them flags the metrics only.
pub const SAMPLING_BUDGET_MS: f64 = 200.0;
pub const TOTAL_BUDGET_MS: f64 = 350.0;

const SAFE_BASELINE_WIDTH: usize = 512;
const SAFE_BASELINE_HEIGHT: usize = 256;

const ENCODER_SCRATCH_BYTES: u64 = 8 * 1024 * 1024;
const SAFETY_HEADROOM_BYTES: u64 = 512 * 1024 * 1024;

pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

// ── Rescue bookkeeping ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    None,
    Sanitized,
    DirectNudge,
    Expanded,
    Wrapped,
    Hint,
    RowReuse,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RescueTally {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub sanitized: u64,
    pub direct_nudge: u64,
    pub expanded: u64,
    pub wrapped: u64,
    pub hint: u64,
    pub row_reuse: u64,
}

impl RescueTally {
    fn count_mode(&mut self, mode: FallbackMode) {
        match mode {
            FallbackMode::None => {}
            FallbackMode::Sanitized => self.sanitized += 1,
            FallbackMode::DirectNudge => self.direct_nudge += 1,
            FallbackMode::Expanded => self.expanded += 1,
            FallbackMode::Wrapped => self.wrapped += 1,
            FallbackMode::Hint => self.hint += 1,
            FallbackMode::RowReuse => self.row_reuse += 1,
        }
    }

    fn merge(&mut self, other: &RescueTally) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.sanitized += other.sanitized;
        self.direct_nudge += other.direct_nudge;
        self.expanded += other.expanded;
        self.wrapped += other.wrapped;
        self.hint += other.hint;
        self.row_reuse += other.row_reuse;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeamStats {
    pub rows_evaluated: usize,
    pub rows_above_tolerance: usize,
    pub rows_with_failures: usize,
    pub forced_reconciliations: usize,
    pub mean_abs_delta_m: f64,
    pub rms_delta_m: f64,
    pub max_abs_delta_m: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportMetrics {
    pub width: usize,
    pub height: usize,
    pub pixel_count: u64,
    pub successful_samples: u64,
    pub failed_samples: u64,
    pub coverage_percent: f64,
    pub mean_walk_steps: f64,
    pub max_walk_steps: u32,
    pub seam: SeamStats,
    pub rescues: RescueTally,
    pub min_elevation_m: f64,
    pub max_elevation_m: f64,
    pub used_amplified: bool,
    pub sampler_setup_ms: f64,
    pub sampling_ms: f64,
    pub encode_ms: f64,
    pub total_ms: f64,
    pub budget_exceeded: bool,
}

// ── Preflight ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PreflightInfo {
    pub pixel_bytes: u64,
    pub sampler_bytes: u64,
    pub scratch_bytes: u64,
    pub safety_bytes: u64,
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub pass: bool,
}

impl PreflightInfo {
    pub fn details(&self) -> String {
        let mib = |b: u64| b as f64 / (1024.0 * 1024.0);
        format!(
            "need={:.1}MiB (pixels={:.1} sampler={:.1} scratch={:.1} safety={:.1}) free={:.1}MiB",
            mib(self.required_bytes),
            mib(self.pixel_bytes),
            mib(self.sampler_bytes),
            mib(self.scratch_bytes),
            mib(self.safety_bytes),
            mib(self.available_bytes)
        )
    }
}

/// Best-effort available-physical-memory probe; conservative default when
/// the platform offers no answer.
fn available_physical_memory() -> u64 {
    if let Ok(text) = std::fs::read_to_string("/proc/meminfo") {
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
                if kb > 0 {
                    return kb * 1024;
                }
            }
        }
    }
    // No probe available: assume a workstation-scale 4 GiB.
    4 * 1024 * 1024 * 1024
}

pub fn preflight(
    width: usize,
    height: usize,
    sampler_bytes: u64,
    available_override: Option<u64>,
) -> PreflightInfo {
    let pixel_bytes = (width as u64) * (height as u64) * 4;
    let available = available_override.unwrap_or_else(available_physical_memory);
    let required = pixel_bytes + sampler_bytes + ENCODER_SCRATCH_BYTES + SAFETY_HEADROOM_BYTES;
    PreflightInfo {
        pixel_bytes,
        sampler_bytes,
        scratch_bytes: ENCODER_SCRATCH_BYTES,
        safety_bytes: SAFETY_HEADROOM_BYTES,
        required_bytes: required,
        available_bytes: available,
        pass: required <= available,
    }
}

// ── Export request ────────────────────────────────────────────────────────

pub struct ExportRequest<'a> {
    pub width: usize,
    pub height: usize,
    pub palette: PaletteMode,
    /// Override the 512x256 safety baseline.
    pub unsafe_export: bool,
    pub output_dir: &'a Path,
    /// Cooperative cancellation, sampled at the top of every tile and row.
    pub shutdown: Option<&'a AtomicBool>,
    /// Test hook: substitute the detected available memory.
    pub available_memory_override: Option<u64>,
}

// ── Per-row machinery ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RowSample {
    elevation: f32,
    hit: bool,
    triangle: i32,
    steps: u8,
    mode: FallbackMode,
}

impl Default for RowSample {
    fn default() -> Self {
        Self {
            elevation: 0.0,
            hit: false,
            triangle: NO_TRIANGLE,
            steps: 0,
            mode: FallbackMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SeamHint {
    sample: RowSample,
    pixel_x: usize,
}

struct RowOutcome {
    rgba: Vec<u8>,
    success: u32,
    step_sum: u64,
    max_steps: u8,
    initial_miss: u32,
    final_miss: u32,
    tally: RescueTally,
    left_core: Option<RowSample>,
    right_core: Option<RowSample>,
    wrap_left: Option<RowSample>,
    wrap_right: Option<RowSample>,
}

fn sanitize_uv(u: f64, v: f64) -> (f64, f64) {
    let mut wrapped = u.rem_euclid(1.0);
    wrapped = wrapped.clamp(POLE_AVOIDANCE_EPSILON, 1.0 - POLE_AVOIDANCE_EPSILON);
    (wrapped, v.clamp(POLE_AVOIDANCE_EPSILON, 1.0 - POLE_AVOIDANCE_EPSILON))
}

/// The rescue ladder for a missed pixel. Returns true on a hit, with the
/// winning mode written into `mode`.
#[allow(clippy::too_many_arguments)]
fn try_fallback_sample(
    sampler: &HeightmapSampler,
    base_u: f64,
    base_v: f64,
    inv_width: f64,
    inv_height: f64,
    info: &mut SampleInfo,
    elevation: &mut f64,
    tally_expanded_attempt: &mut bool,
    mode: &mut FallbackMode,
) -> bool {
    *mode = FallbackMode::None;
    *tally_expanded_attempt = false;

    let (su, sv) = sanitize_uv(base_u, base_v);
    if (su - base_u).abs() > 1e-12 || (sv - base_v).abs() > 1e-12 {
        let mut candidate = SampleInfo::default();
        let z = sampler.sample_at_uv(su, sv, &mut candidate);
        if candidate.hit {
            *info = candidate;
            *elevation = z;
            *mode = FallbackMode::Sanitized;
            return true;
        }
    }

    let mut try_candidate =
        |u: f64, v: f64, info: &mut SampleInfo, elevation: &mut f64| -> bool {
            let (cu, cv) = sanitize_uv(u, v);
            if (cu - su).abs() < 1e-12 && (cv - sv).abs() < 1e-12 {
                return false;
            }
            let mut candidate = SampleInfo::default();
            let z = sampler.sample_at_uv(cu, cv, &mut candidate);
            if candidate.hit {
                *info = candidate;
                *elevation = z;
                return true;
            }
            false
        };

    let nudge = POLE_AVOIDANCE_EPSILON * 4.0;
    for (du, dv) in [(nudge, 0.0), (-nudge, 0.0), (0.0, nudge), (0.0, -nudge)] {
        if try_candidate(base_u + du, base_v + dv, info, elevation) {
            *mode = FallbackMode::DirectNudge;
            return true;
        }
    }

    let step_u = (inv_width * 0.5).max(nudge);
    let step_v = (inv_height * 0.5).max(nudge);
    for scale in [1.0, 2.0] {
        for dx in -1i32..=1 {
            for dy in -1i32..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                *tally_expanded_attempt = true;
                let u = base_u + dx as f64 * step_u * scale;
                let v = base_v + dy as f64 * step_v * scale;
                if try_candidate(u, v, info, elevation) {
                    *mode = FallbackMode::Expanded;
                    return true;
                }
            }
        }
    }

    for u in [base_u + 1.0 - step_u, base_u - 1.0 + step_u] {
        *tally_expanded_attempt = true;
        if try_candidate(u, base_v, info, elevation) {
            *mode = FallbackMode::Wrapped;
            return true;
        }
    }

    false
}

#[allow(clippy::too_many_arguments)]
fn process_row(
    sampler: &HeightmapSampler,
    palette: &HeightmapPalette,
    width: usize,
    height: usize,
    global_y: usize,
    sample_start_x: usize,
    sample_end_x: usize,
    core_start_x: usize,
    core_end_x: usize,
    seam_hint: Option<SeamHint>,
) -> RowOutcome {
    let inv_width = 1.0 / width as f64;
    let inv_height = 1.0 / height as f64;
    let v = (global_y as f64 + 0.5) * inv_height;
    let sample_width = sample_end_x - sample_start_x;

    let mut outcome = RowOutcome {
        rgba: vec![0u8; sample_width * 4],
        success: 0,
        step_sum: 0,
        max_steps: 0,
        initial_miss: 0,
        final_miss: 0,
        tally: RescueTally::default(),
        left_core: None,
        right_core: None,
        wrap_left: None,
        wrap_right: None,
    };

    // Row-local rescue state: the last triangle that produced a hit.
    let mut row_last_triangle = NO_TRIANGLE;

    for local_x in 0..sample_width {
        let global_x = sample_start_x + local_x;
        if global_x >= width {
            break;
        }
        let in_core = global_x >= core_start_x && global_x < core_end_x;
        let u = (global_x as f64 + 0.5) * inv_width;

        let mut info = SampleInfo::default();
        let mut elevation = 0.0f64;
        let mut mode = FallbackMode::None;
        let mut used_hint = false;

        if in_core && global_x == core_start_x {
            if let Some(hint) = seam_hint {
                if hint.sample.hit && hint.sample.triangle != NO_TRIANGLE {
                    if sampler.sample_at_uv_with_hint(
                        u,
                        v,
                        hint.sample.triangle,
                        &mut info,
                        &mut elevation,
                    ) {
                        used_hint = true;
                        mode = FallbackMode::Hint;
                    }
                }
            }
        }
        if !used_hint {
            elevation = sampler.sample_at_uv(u, v, &mut info);
        }

        let initial_hit = info.hit;
        let mut final_hit = initial_hit;
        if !initial_hit {
            if in_core {
                outcome.initial_miss += 1;
                outcome.tally.attempts += 1;
            }
            let mut expanded_attempted = false;
            final_hit = try_fallback_sample(
                sampler,
                u,
                v,
                inv_width,
                inv_height,
                &mut info,
                &mut elevation,
                &mut expanded_attempted,
                &mut mode,
            );

            // Clamped hint on whatever triangle the failed walk reached.
            if !final_hit && info.triangle != NO_TRIANGLE {
                let last = info.triangle;
                let mut clamped = SampleInfo::default();
                let mut z = elevation;
                if sampler.sample_at_uv_clamped_hint(u, v, last, &mut clamped, &mut z) {
                    final_hit = true;
                    info = clamped;
                    elevation = z;
                    mode = FallbackMode::Sanitized;
                }
            }
            // Row reuse: clamp to the row's last good triangle.
            if !final_hit && row_last_triangle != NO_TRIANGLE {
                let mut clamped = SampleInfo::default();
                let mut z = elevation;
                if sampler.sample_at_uv_clamped_hint(u, v, row_last_triangle, &mut clamped, &mut z)
                {
                    final_hit = true;
                    info = clamped;
                    elevation = z;
                    mode = FallbackMode::RowReuse;
                }
            }

            if in_core {
                if final_hit {
                    outcome.tally.successes += 1;
                } else {
                    outcome.tally.failures += 1;
                }
            }
        }

        let used_fallback = used_hint || (!initial_hit && final_hit);
        if in_core && used_fallback {
            outcome.tally.count_mode(mode);
        }

        let steps = info.steps.min(255) as u8;
        if in_core {
            if final_hit && info.hit {
                outcome.success += 1;
                row_last_triangle = info.triangle;
            } else {
                outcome.final_miss += 1;
                row_last_triangle = NO_TRIANGLE;
            }
            outcome.step_sum += steps as u64;
            outcome.max_steps = outcome.max_steps.max(steps);
        }

        let sample = RowSample {
            elevation: elevation as f32,
            hit: final_hit && info.hit,
            triangle: if final_hit { info.triangle } else { NO_TRIANGLE },
            steps,
            mode,
        };
        if in_core {
            if global_x == core_start_x {
                outcome.left_core = Some(sample);
            }
            if global_x == core_end_x - 1 {
                outcome.right_core = Some(sample);
            }
            if global_x == 0 {
                outcome.wrap_left = Some(sample);
            }
            if global_x == width - 1 {
                outcome.wrap_right = Some(sample);
            }
        }

        let rgb = palette.sample(elevation);
        let offset = local_x * 4;
        outcome.rgba[offset] = rgb[0];
        outcome.rgba[offset + 1] = rgb[1];
        outcome.rgba[offset + 2] = rgb[2];
        outcome.rgba[offset + 3] = 255;
    }

    outcome
}

// ── Export driver ─────────────────────────────────────────────────────────

/// Rasterise the sampler onto a `width × height` RGBA PNG. Returns the
/// absolute path of the written file plus the export metrics.
pub fn export_heightmap(
    sampler: &HeightmapSampler,
    min_elevation_m: f64,
    max_elevation_m: f64,
    request: &ExportRequest<'_>,
) -> Result<(PathBuf, ExportMetrics)> {
    let export_start = Instant::now();
    let width = request.width;
    let height = request.height;

    if width == 0 || height == 0 {
        error!("heightmap export rejected: dimensions {width}x{height}");
        return Err(LithosError::Config(format!(
            "invalid heightmap dimensions {width}x{height}"
        )));
    }
    if !request.unsafe_export
        && (width > SAFE_BASELINE_WIDTH
            || height > SAFE_BASELINE_HEIGHT
            || width * height > SAFE_BASELINE_WIDTH * SAFE_BASELINE_HEIGHT)
    {
        error!(
            "heightmap export rejected: {width}x{height} exceeds the {SAFE_BASELINE_WIDTH}x{SAFE_BASELINE_HEIGHT} safety baseline"
        );
        return Err(LithosError::Config(format!(
            "dimensions {width}x{height} exceed the safety baseline; set unsafe_heightmap_export to override"
        )));
    }

    let stats = sampler.memory_stats();
    let info = preflight(
        width,
        height,
        stats.total_bytes() as u64,
        request.available_memory_override,
    );
    if !info.pass {
        error!("heightmap preflight abort: {}", info.details());
        return Err(LithosError::MemoryPressure(info.details()));
    }
    info!("heightmap preflight: {}", info.details());

    let palette = HeightmapPalette::from_mode(request.palette, min_elevation_m, max_elevation_m);

    let mut raw = vec![0u8; width * height * 4];
    let mut row_seam_hints: Vec<Option<SeamHint>> = vec![None; height];
    let mut wrap_left: Vec<Option<RowSample>> = vec![None; height];
    let mut wrap_right: Vec<Option<RowSample>> = vec![None; height];
    let mut row_success = vec![0u32; height];
    let mut row_step_sums = vec![0u64; height];
    let mut row_max_steps = vec![0u8; height];
    let mut tally = RescueTally::default();
    let mut seam = SeamStats::default();
    let mut seam_abs_sum = 0.0f64;
    let mut seam_rms_sum = 0.0f64;
    let mut final_miss_total = 0u64;

    let sampling_start = Instant::now();
    let tiles_x = width.div_ceil(TILE_SIZE);
    let tiles_y = height.div_ceil(TILE_SIZE);
    let mut tile_counter = 0usize;

    for tile_y in 0..tiles_y {
        let core_start_y = tile_y * TILE_SIZE;
        let core_end_y = (core_start_y + TILE_SIZE).min(height);
        let sample_start_y = core_start_y.saturating_sub(TILE_OVERLAP);
        let sample_end_y = (core_end_y + TILE_OVERLAP).min(height);

        // Seam hints chain tiles left to right within one tile row.
        for y in core_start_y..core_end_y {
            row_seam_hints[y] = None;
        }

        for tile_x in 0..tiles_x {
            if let Some(flag) = request.shutdown {
                if flag.load(Ordering::Relaxed) {
                    warn!("heightmap export cancelled at tile ({tile_x},{tile_y})");
                    return Err(LithosError::DataUnavailable("export cancelled".into()));
                }
            }
            tile_counter += 1;

            let core_start_x = tile_x * TILE_SIZE;
            let core_end_x = (core_start_x + TILE_SIZE).min(width);
            let sample_start_x = core_start_x.saturating_sub(TILE_OVERLAP);
            let sample_end_x = (core_end_x + TILE_OVERLAP).min(width);

            let tile_start = Instant::now();
            let hints: Vec<Option<SeamHint>> = (sample_start_y..sample_end_y)
                .map(|y| row_seam_hints[y])
                .collect();

            let mut rows: Vec<(usize, RowOutcome)> = (sample_start_y..sample_end_y)
                .into_par_iter()
                .map(|global_y| {
                    let outcome = process_row(
                        sampler,
                        &palette,
                        width,
                        height,
                        global_y,
                        sample_start_x,
                        sample_end_x,
                        core_start_x,
                        core_end_x,
                        hints[global_y - sample_start_y],
                    );
                    (global_y, outcome)
                })
                .collect();

            // Seam reconciliation against the previous tile's right edge.
            if tile_x > 0 {
                for (global_y, outcome) in &mut rows {
                    let y = *global_y;
                    if y < core_start_y || y >= core_end_y {
                        continue;
                    }
                    let Some(hint) = row_seam_hints[y] else { continue };
                    let Some(mut left) = (hint.sample.hit
                        && hint.sample.triangle != NO_TRIANGLE)
                        .then_some(hint.sample)
                    else {
                        seam.rows_with_failures += 1;
                        continue;
                    };
                    let Some(mut right) = outcome.left_core.filter(|s| s.hit) else {
                        seam.rows_with_failures += 1;
                        continue;
                    };

                    let delta_before =
                        (left.elevation as f64 - right.elevation as f64).abs();
                    let rescued = |m: FallbackMode| {
                        m == FallbackMode::Expanded || m == FallbackMode::Hint
                    };
                    let mut delta_after = delta_before;

                    if delta_before > SEAM_TOLERANCE_M
                        && (rescued(left.mode) || rescued(right.mode))
                    {
                        let seam_v = (y as f64 + 0.5) / height as f64;
                        let left_u = (hint.pixel_x as f64 + 0.5) / width as f64;
                        let right_u = (core_start_x as f64 + 0.5) / width as f64;

                        let mut left_info = SampleInfo::default();
                        let mut left_z = left.elevation as f64;
                        let left_ok = sampler.sample_at_uv_with_hint(
                            left_u,
                            seam_v,
                            right.triangle,
                            &mut left_info,
                            &mut left_z,
                        );
                        if !left_ok {
                            left_z = left.elevation as f64;
                        }

                        let mut right_info = SampleInfo::default();
                        let mut right_z = right.elevation as f64;
                        let right_ok = sampler.sample_at_uv_with_hint(
                            right_u,
                            seam_v,
                            left.triangle,
                            &mut right_info,
                            &mut right_z,
                        );
                        if !right_ok {
                            right_z = left_z;
                        }

                        delta_after = (left_z - right_z).abs();
                        if delta_after > SEAM_TOLERANCE_M {
                            // Physical accuracy yields to continuity: the
                            // right side adopts the left value.
                            right_z = left_z;
                            delta_after = 0.0;
                            seam.forced_reconciliations += 1;
                        }

                        // Rewrite the two pixels and the chained state.
                        let left_rgb = palette.sample(left_z);
                        let left_offset =
                            (y * width + hint.pixel_x) * 4;
                        raw[left_offset..left_offset + 3].copy_from_slice(&left_rgb);
                        raw[left_offset + 3] = 255;

                        let local_x = core_start_x - sample_start_x;
                        let right_rgb = palette.sample(right_z);
                        let offset = local_x * 4;
                        outcome.rgba[offset..offset + 3].copy_from_slice(&right_rgb);
                        outcome.rgba[offset + 3] = 255;

                        left.elevation = left_z as f32;
                        left.mode = FallbackMode::Hint;
                        if left_ok {
                            left.triangle = left_info.triangle;
                        }
                        row_seam_hints[y] = Some(SeamHint { sample: left, pixel_x: hint.pixel_x });

                        right.elevation = right_z as f32;
                        right.mode = FallbackMode::Hint;
                        if right_ok {
                            right.triangle = right_info.triangle;
                        }
                        outcome.left_core = Some(right);

                        debug!(
                            "seam fix: x={core_start_x} y={y} before={delta_before:.3} after={delta_after:.3}"
                        );
                    }

                    seam.rows_evaluated += 1;
                    seam_abs_sum += delta_after;
                    seam_rms_sum += delta_after * delta_after;
                    seam.max_abs_delta_m = seam.max_abs_delta_m.max(delta_after);
                    if delta_after > SEAM_TOLERANCE_M {
                        seam.rows_above_tolerance += 1;
                    }
                }
            }

            // Merge row outcomes: stitch core pixels, accumulate stats,
            // refresh the seam hints from the right core column.
            for (global_y, outcome) in rows {
                let y = global_y;
                let row_in_core = y >= core_start_y && y < core_end_y;
                if row_in_core {
                    let local_offset = (core_start_x - sample_start_x) * 4;
                    let core_bytes = (core_end_x - core_start_x) * 4;
                    let dest = (y * width + core_start_x) * 4;
                    raw[dest..dest + core_bytes]
                        .copy_from_slice(&outcome.rgba[local_offset..local_offset + core_bytes]);

                    row_success[y] += outcome.success;
                    row_step_sums[y] += outcome.step_sum;
                    row_max_steps[y] = row_max_steps[y].max(outcome.max_steps);
                    final_miss_total += outcome.final_miss as u64;
                    tally.merge(&outcome.tally);

                    if let Some(sample) = outcome.right_core {
                        row_seam_hints[y] = Some(SeamHint { sample, pixel_x: core_end_x - 1 });
                    }
                    if let Some(sample) = outcome.wrap_left {
                        wrap_left[y] = Some(sample);
                    }
                    if let Some(sample) = outcome.wrap_right {
                        wrap_right[y] = Some(sample);
                    }
                }
            }

            debug!(
                "tile {tile_counter}/{} core=({core_start_x},{core_start_y})-({core_end_x},{core_end_y}) ms={:.2}",
                tiles_x * tiles_y,
                tile_start.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    // Seam statistics: interior tile borders when they exist, otherwise
    // the wrap columns at the antimeridian.
    if seam.rows_evaluated > 0 {
        seam.mean_abs_delta_m = seam_abs_sum / seam.rows_evaluated as f64;
        seam.rms_delta_m = (seam_rms_sum / seam.rows_evaluated as f64).sqrt();
    } else if width >= 2 {
        let mut abs_sum = 0.0;
        let mut rms_sum = 0.0;
        for y in 0..height {
            match (wrap_left[y], wrap_right[y]) {
                (Some(l), Some(r)) if l.hit && r.hit => {
                    let delta = (l.elevation as f64 - r.elevation as f64).abs();
                    abs_sum += delta;
                    rms_sum += delta * delta;
                    seam.rows_evaluated += 1;
                    seam.max_abs_delta_m = seam.max_abs_delta_m.max(delta);
                    if delta > SEAM_TOLERANCE_M {
                        seam.rows_above_tolerance += 1;
                    }
                }
                _ => seam.rows_with_failures += 1,
            }
        }
        if seam.rows_evaluated > 0 {
            seam.mean_abs_delta_m = abs_sum / seam.rows_evaluated as f64;
            seam.rms_delta_m = (rms_sum / seam.rows_evaluated as f64).sqrt();
        }
    }

    let sampling_ms = sampling_start.elapsed().as_secs_f64() * 1000.0;

    let pixel_count = (width * height) as u64;
    let successful: u64 = row_success.iter().map(|&s| s as u64).sum();
    let step_sum: u64 = row_step_sums.iter().sum();
    let max_steps = row_max_steps.iter().copied().max().unwrap_or(0) as u32;

    let mut metrics = ExportMetrics {
        width,
        height,
        pixel_count,
        successful_samples: successful,
        failed_samples: final_miss_total,
        coverage_percent: if pixel_count > 0 {
            successful as f64 / pixel_count as f64 * 100.0
        } else {
            0.0
        },
        mean_walk_steps: if pixel_count > 0 {
            step_sum as f64 / pixel_count as f64
        } else {
            0.0
        },
        max_walk_steps: max_steps,
        seam,
        rescues: tally,
        min_elevation_m,
        max_elevation_m,
        used_amplified: sampler.uses_amplified_elevation(),
        sampler_setup_ms: 0.0,
        sampling_ms,
        encode_ms: 0.0,
        total_ms: 0.0,
        budget_exceeded: false,
    };

    info!(
        "heightmap coverage: pixels={} success={} ({:.3}%) failures={} avg_steps={:.2} max_steps={}",
        metrics.pixel_count,
        metrics.successful_samples,
        metrics.coverage_percent,
        metrics.failed_samples,
        metrics.mean_walk_steps,
        metrics.max_walk_steps
    );

    // ── PNG encode with signature verification ───────────────────────────
    let encode_start = Instant::now();
    let mut compressed = Vec::new();
    PngEncoder::new(&mut compressed).write_image(
        &raw,
        width as u32,
        height as u32,
        ExtendedColorType::Rgba8,
    )?;
    if compressed.is_empty() {
        return Err(LithosError::DataUnavailable("PNG encoder produced no bytes".into()));
    }

    if compressed.len() < 8 || compressed[..8] != PNG_MAGIC {
        // A writer that zeroes the signature gets its header rebuilt; any
        // other missing-signature shape gets one prepended.
        let zeroed = compressed.len() >= 8 && compressed[..8].iter().all(|&b| b == 0);
        let skip = if zeroed {
            warn!("PNG signature was zeroed by the encoder; rebuilding header");
            8
        } else {
            warn!("PNG signature missing; prepending header");
            0
        };
        let mut fixed = Vec::with_capacity(compressed.len() - skip + 8);
        fixed.extend_from_slice(&PNG_MAGIC);
        fixed.extend_from_slice(&compressed[skip..]);
        compressed = fixed;
    }

    std::fs::create_dir_all(request.output_dir)?;
    let output_path = request.output_dir.join("heightmap_visualization.png");
    std::fs::write(&output_path, &compressed)?;
    let output_path = output_path.canonicalize().unwrap_or(output_path);
    metrics.encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

    metrics.total_ms = export_start.elapsed().as_secs_f64() * 1000.0;
    metrics.budget_exceeded =
        metrics.sampling_ms > SAMPLING_BUDGET_MS || metrics.total_ms > TOTAL_BUDGET_MS;
    if metrics.budget_exceeded {
        warn!(
            "heightmap budget exceeded: sampling={:.2}ms (budget {SAMPLING_BUDGET_MS}) total={:.2}ms (budget {TOTAL_BUDGET_MS})",
            metrics.sampling_ms, metrics.total_ms
        );
    }

    info!(
        "exported heightmap {}x{}: {} (seam rows>{SEAM_TOLERANCE_M}m: {}, forced: {})",
        width,
        height,
        output_path.display(),
        metrics.seam.rows_above_tolerance,
        metrics.seam.forced_reconciliations
    );

    Ok((output_path, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::mesh::backend::triangulate_with;
    use crate::sampling::fibonacci_sphere;

    fn smooth_sampler(n: usize) -> (HeightmapSampler, f64, f64) {
        let points = fibonacci_sphere(n);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        // Latitude-only field: longitudinally constant, so the wrap seam
        // is analytically tight.
        let elevation: Vec<f64> = points.iter().map(|p| -2000.0 + 3000.0 * p.z).collect();
        let min = elevation.iter().cloned().fold(f64::MAX, f64::min);
        let max = elevation.iter().cloned().fold(f64::MIN, f64::max);
        (HeightmapSampler::new(points, elevation, tris, false).unwrap(), min, max)
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lithos-export-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn export_512x256_has_full_coverage_and_png_magic() {
        let (sampler, min, max) = smooth_sampler(4_000);
        let dir = temp_dir("baseline");
        let request = ExportRequest {
            width: 512,
            height: 256,
            palette: PaletteMode::Hypsometric,
            unsafe_export: false,
            output_dir: &dir,
            shutdown: None,
            available_memory_override: Some(u64::MAX),
        };
        let (path, metrics) = export_heightmap(&sampler, min, max, &request).unwrap();

        assert_eq!(metrics.pixel_count, 512 * 256);
        assert_eq!(metrics.successful_samples, 512 * 256, "coverage must be 100%");
        assert_eq!(metrics.failed_samples, 0);
        assert!((metrics.coverage_percent - 100.0).abs() < 1e-9);
        assert!(
            metrics.seam.max_abs_delta_m <= SEAM_TOLERANCE_M,
            "wrap seam too wide: {} m",
            metrics.seam.max_abs_delta_m
        );

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 8);
        assert_eq!(&bytes[..8], &PNG_MAGIC, "file must start with the PNG signature");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tiled_export_reconciles_interior_seams() {
        let (sampler, min, max) = smooth_sampler(3_000);
        let dir = temp_dir("tiled");
        // 600 wide forces two tile columns with one interior seam.
        let request = ExportRequest {
            width: 600,
            height: 128,
            palette: PaletteMode::Hypsometric,
            unsafe_export: true,
            output_dir: &dir,
            shutdown: None,
            available_memory_override: Some(u64::MAX),
        };
        let (_, metrics) = export_heightmap(&sampler, min, max, &request).unwrap();
        assert_eq!(metrics.successful_samples, 600 * 128);
        assert!(metrics.seam.rows_evaluated > 0, "interior seams must be evaluated");
        assert_eq!(
            metrics.seam.rows_above_tolerance, 0,
            "post-fix seams above tolerance: {:?}",
            metrics.seam
        );
        assert!(metrics.seam.rms_delta_m <= SEAM_TOLERANCE_M);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn safety_baseline_blocks_large_exports() {
        let (sampler, min, max) = smooth_sampler(500);
        let dir = temp_dir("safety");
        let request = ExportRequest {
            width: 1024,
            height: 512,
            palette: PaletteMode::Hypsometric,
            unsafe_export: false,
            output_dir: &dir,
            shutdown: None,
            available_memory_override: Some(u64::MAX),
        };
        match export_heightmap(&sampler, min, max, &request) {
            Err(LithosError::Config(msg)) => assert!(msg.contains("safety baseline")),
            other => panic!("expected a config error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn preflight_rejects_when_memory_is_tight() {
        let (sampler, min, max) = smooth_sampler(500);
        let dir = temp_dir("preflight");
        let request = ExportRequest {
            width: 512,
            height: 256,
            palette: PaletteMode::Hypsometric,
            unsafe_export: false,
            output_dir: &dir,
            shutdown: None,
            available_memory_override: Some(1024), // 1 KiB: nothing fits
        };
        match export_heightmap(&sampler, min, max, &request) {
            Err(LithosError::MemoryPressure(details)) => {
                assert!(details.contains("need"), "details should carry the budget: {details}")
            }
            other => panic!("expected memory pressure, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cancellation_is_cooperative() {
        let (sampler, min, max) = smooth_sampler(500);
        let dir = temp_dir("cancel");
        let flag = AtomicBool::new(true);
        let request = ExportRequest {
            width: 256,
            height: 128,
            palette: PaletteMode::Hypsometric,
            unsafe_export: false,
            output_dir: &dir,
            shutdown: Some(&flag),
            available_memory_override: Some(u64::MAX),
        };
        assert!(export_heightmap(&sampler, min, max, &request).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn normalized_palette_export_succeeds() {
        let (sampler, min, max) = smooth_sampler(1_000);
        let dir = temp_dir("normalized");
        let request = ExportRequest {
            width: 128,
            height: 64,
            palette: PaletteMode::Normalized,
            unsafe_export: false,
            output_dir: &dir,
            shutdown: None,
            available_memory_override: Some(u64::MAX),
        };
        let (path, metrics) = export_heightmap(&sampler, min, max, &request).unwrap();
        assert_eq!(metrics.successful_samples, 128 * 64);
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn preflight_arithmetic_adds_every_component() {
        let info = preflight(512, 256, 10_000_000, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(info.pixel_bytes, 512 * 256 * 4);
        assert_eq!(
            info.required_bytes,
            info.pixel_bytes + info.sampler_bytes + info.scratch_bytes + info.safety_bytes
        );
        assert!(info.pass);
        let tight = preflight(512, 256, 10_000_000, Some(1024));
        assert!(!tight.pass);
    }
}
