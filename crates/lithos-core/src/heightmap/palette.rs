//! Elevation-to-colour mapping for heightmap export.
//!
//! The hypsometric gradient keys on absolute altitude bands following
//! physical relief map conventions, so mountains are always red and
//! abyssal ocean always navy regardless of the field's range. The
//! normalized mode stretches the same gradient across the exported
//! min/max instead; a degenerate range falls back to hypsometric.

use log::warn;

use crate::config::PaletteMode;

/// Gradient stop: absolute elevation in metres and linear-space RGB.
struct Stop {
    elevation_m: f64,
    rgb: [f32; 3],
}

const GRADIENT: [Stop; 21] = [
    // Abyssal ocean.
    Stop { elevation_m: -6000.0, rgb: [0.000, 0.059, 0.196] }, // midnight navy
    Stop { elevation_m: -4000.0, rgb: [0.078, 0.196, 0.471] }, // dark cobalt
    // Deep ocean to shelf.
    Stop { elevation_m: -3000.0, rgb: [0.118, 0.314, 0.588] },
    Stop { elevation_m: -2000.0, rgb: [0.196, 0.431, 0.706] },
    Stop { elevation_m: -1000.0, rgb: [0.275, 0.549, 0.784] }, // teal
    // Shallow water.
    Stop { elevation_m: -500.0, rgb: [0.392, 0.706, 0.863] },
    Stop { elevation_m: -200.0, rgb: [0.471, 0.824, 0.922] },
    Stop { elevation_m: -100.0, rgb: [0.510, 0.843, 0.843] },
    Stop { elevation_m: -50.0, rgb: [0.549, 0.863, 0.784] },
    Stop { elevation_m: -25.0, rgb: [0.588, 0.882, 0.706] },
    Stop { elevation_m: -10.0, rgb: [0.627, 0.902, 0.627] },
    // Shoreline emergence.
    Stop { elevation_m: 0.0, rgb: [0.667, 0.922, 0.588] }, // spring green
    Stop { elevation_m: 100.0, rgb: [0.392, 0.784, 0.314] },
    Stop { elevation_m: 500.0, rgb: [0.235, 0.588, 0.235] }, // forest green
    // Rising terrain.
    Stop { elevation_m: 1000.0, rgb: [0.471, 0.706, 0.275] },
    Stop { elevation_m: 1500.0, rgb: [0.863, 0.784, 0.235] },
    Stop { elevation_m: 2000.0, rgb: [0.902, 0.588, 0.196] }, // burnt orange
    // Mountain peaks.
    Stop { elevation_m: 3000.0, rgb: [0.941, 0.392, 0.157] },
    Stop { elevation_m: 4000.0, rgb: [0.863, 0.196, 0.118] },
    Stop { elevation_m: 5000.0, rgb: [0.706, 0.078, 0.078] },
    Stop { elevation_m: 6000.0, rgb: [0.549, 0.039, 0.039] }, // blood red
];

fn gradient_color(elevation_m: f64) -> [u8; 3] {
    let first = &GRADIENT[0];
    let last = &GRADIENT[GRADIENT.len() - 1];
    if elevation_m <= first.elevation_m {
        return to_bytes(first.rgb);
    }
    if elevation_m >= last.elevation_m {
        return to_bytes(last.rgb);
    }
    for pair in GRADIENT.windows(2) {
        let (lo, hi) = (&pair[0], &pair[1]);
        if elevation_m >= lo.elevation_m && elevation_m <= hi.elevation_m {
            let range = hi.elevation_m - lo.elevation_m;
            let alpha = if range > 1e-9 {
                ((elevation_m - lo.elevation_m) / range) as f32
            } else {
                0.0
            };
            // Linear RGB interpolation preserves saturation across bands.
            let rgb = [
                lo.rgb[0] + (hi.rgb[0] - lo.rgb[0]) * alpha,
                lo.rgb[1] + (hi.rgb[1] - lo.rgb[1]) * alpha,
                lo.rgb[2] + (hi.rgb[2] - lo.rgb[2]) * alpha,
            ];
            return to_bytes(rgb);
        }
    }
    [255, 0, 255] // unreachable
}

fn to_bytes(rgb: [f32; 3]) -> [u8; 3] {
    [
        (rgb[0].clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb[1].clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb[2].clamp(0.0, 1.0) * 255.0).round() as u8,
    ]
}

/// A resolved palette, ready to colour pixels.
#[derive(Debug, Clone, Copy)]
pub struct HeightmapPalette {
    normalized_requested: bool,
    normalized_active: bool,
    min_m: f64,
    range_m: f64,
}

impl HeightmapPalette {
    /// Resolve a palette for the export's elevation range. A normalized
    /// request over a degenerate range falls back to hypsometric.
    pub fn from_mode(mode: PaletteMode, min_elevation_m: f64, max_elevation_m: f64) -> Self {
        let range = max_elevation_m - min_elevation_m;
        let normalized_requested = mode == PaletteMode::Normalized;
        let normalized_active = normalized_requested && range > 1e-6;
        if normalized_requested && !normalized_active {
            warn!(
                "normalized palette requested but the elevation range is degenerate ({range:.6} m); using hypsometric colors"
            );
        }
        Self {
            normalized_requested,
            normalized_active,
            min_m: min_elevation_m,
            range_m: range,
        }
    }

    pub fn normalized_requested(&self) -> bool {
        self.normalized_requested
    }

    pub fn uses_normalized_sampling(&self) -> bool {
        self.normalized_active
    }

    pub fn range(&self) -> f64 {
        self.range_m
    }

    /// Colour for an elevation, as RGB bytes.
    pub fn sample(&self, elevation_m: f64) -> [u8; 3] {
        if self.normalized_active {
            let t = ((elevation_m - self.min_m) / self.range_m).clamp(0.0, 1.0);
            let span = GRADIENT[GRADIENT.len() - 1].elevation_m - GRADIENT[0].elevation_m;
            gradient_color(GRADIENT[0].elevation_m + t * span)
        } else {
            gradient_color(elevation_m)
        }
    }
}
