//! Oceanic Stage B: procedural fault fabric for young oceanic crust.
//!
//! The detail signal is a ridged sine banding oriented by the local ridge
//! direction, phase-warped by low-frequency gradient noise, with a fine
//! grain term sampled off-axis along the spreading direction. Amplitude
//! decays with crust age as `exp(-age/τ)`.
//!
//! Both formulations evaluate the same expression; the CPU path
//! accumulates in f64, the dispatch path stays in f32 throughout. Their
//! results agree well within the 0.1 m parity budget.

use noise::{NoiseFn, Perlin};

use crate::amplify::snapshot::OceanicSnapshot;

/// Low-frequency phase warp scale.
const WARP_SCALE: f64 = 3.0;
/// Fine-grain noise scale.
const GRAIN_SCALE: f64 = 12.0;
/// Fixed anchor giving the banding a stable global phase.
const ANCHOR: [f64; 3] = [0.371, 0.557, 0.743];
/// Mix between the ridged banding and the grain term.
const BAND_WEIGHT: f64 = 0.75;

struct FaultInputs {
    band_coord: f64,
    grain: f64,
    age_ma: f64,
}

/// Evaluate the shared noise taps for one vertex; `None` when the vertex
/// carries no ridge direction (no fault fabric without a ridge frame).
fn fault_inputs(
    perlin: &Perlin,
    position: [f32; 3],
    ridge_dir: [f32; 3],
    age_ma: f32,
    fault_frequency: f32,
) -> Option<FaultInputs> {
    let p = [position[0] as f64, position[1] as f64, position[2] as f64];
    let r = [ridge_dir[0] as f64, ridge_dir[1] as f64, ridge_dir[2] as f64];
    let r_len2 = r[0] * r[0] + r[1] * r[1] + r[2] * r[2];
    if r_len2 < 1e-12 {
        return None;
    }

    // Spreading direction: tangent perpendicular to the ridge direction.
    let across = [
        r[1] * p[2] - r[2] * p[1],
        r[2] * p[0] - r[0] * p[2],
        r[0] * p[1] - r[1] * p[0],
    ];
    let across_len = (across[0] * across[0] + across[1] * across[1] + across[2] * across[2]).sqrt();
    if across_len < 1e-9 {
        return None;
    }
    let across = [across[0] / across_len, across[1] / across_len, across[2] / across_len];

    let warp = perlin.get([p[0] * WARP_SCALE, p[1] * WARP_SCALE, p[2] * WARP_SCALE]);
    let aligned = across[0] * ANCHOR[0] + across[1] * ANCHOR[1] + across[2] * ANCHOR[2];
    let band_coord = fault_frequency as f64 * (aligned + 0.25 * warp);

    let grain = perlin.get([
        p[0] * GRAIN_SCALE + across[0],
        p[1] * GRAIN_SCALE + across[1],
        p[2] * GRAIN_SCALE + across[2],
    ]);

    Some(FaultInputs { band_coord, grain, age_ma: age_ma as f64 })
}

/// CPU formulation: f64 accumulation.
pub fn amplify_oceanic_cpu(snapshot: &OceanicSnapshot) -> Vec<f64> {
    let perlin = Perlin::new(snapshot.params.noise_seed);
    let mut amplified = Vec::with_capacity(snapshot.vertex_count);
    for i in 0..snapshot.vertex_count {
        let baseline = snapshot.baseline_m[i] as f64;
        if snapshot.oceanic_mask[i] == 0 {
            amplified.push(baseline);
            continue;
        }
        let Some(inputs) = fault_inputs(
            &perlin,
            snapshot.positions[i],
            snapshot.ridge_directions[i],
            snapshot.crust_age_ma[i],
            snapshot.params.fault_frequency,
        ) else {
            amplified.push(baseline);
            continue;
        };

        let ridged = 1.0 - inputs.band_coord.sin().abs();
        let centered = ridged * 2.0 - 1.0;
        let shape = BAND_WEIGHT * centered + (1.0 - BAND_WEIGHT) * inputs.grain;
        let amplitude = snapshot.params.ridge_amplitude_m as f64
            * (-inputs.age_ma / snapshot.params.age_falloff_ma as f64).exp();
        amplified.push(baseline + amplitude * shape);
    }
    amplified
}

/// Dispatch formulation: identical expression, f32 accumulation. This is
/// what the dispatch-ring worker runs.
pub fn amplify_oceanic_f32(snapshot: &OceanicSnapshot) -> Vec<f32> {
    let perlin = Perlin::new(snapshot.params.noise_seed);
    let mut amplified = Vec::with_capacity(snapshot.vertex_count);
    for i in 0..snapshot.vertex_count {
        let baseline = snapshot.baseline_m[i];
        if snapshot.oceanic_mask[i] == 0 {
            amplified.push(baseline);
            continue;
        }
        let Some(inputs) = fault_inputs(
            &perlin,
            snapshot.positions[i],
            snapshot.ridge_directions[i],
            snapshot.crust_age_ma[i],
            snapshot.params.fault_frequency,
        ) else {
            amplified.push(baseline);
            continue;
        };

        let ridged = 1.0f32 - (inputs.band_coord as f32).sin().abs();
        let centered = ridged * 2.0 - 1.0;
        let shape = BAND_WEIGHT as f32 * centered + (1.0 - BAND_WEIGHT) as f32 * inputs.grain as f32;
        let amplitude = snapshot.params.ridge_amplitude_m
            * (-(inputs.age_ma as f32) / snapshot.params.age_falloff_ma).exp();
        amplified.push(baseline + amplitude * shape);
    }
    amplified
}
