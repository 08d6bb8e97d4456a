//! CLI driver: build a planet, run simulation steps, export the
//! equirectangular heightmap, and write a validation summary JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde_json::json;

use lithos_core::amplify::exemplar::{ExemplarAtlas, ExemplarLibrary};
use lithos_core::metrics::write_summary;
use lithos_core::{Simulation, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "lithos-export", about = "Tectonic planet simulation and heightmap export")]
struct Args {
    /// Path to a JSON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RNG seed (overrides the config file).
    #[arg(long)]
    seed: Option<u64>,

    /// Fibonacci sample count (overrides the config file).
    #[arg(long)]
    samples: Option<usize>,

    /// Simulation steps to run before exporting (2 Ma each).
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Heightmap width in pixels.
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Heightmap height in pixels.
    #[arg(long, default_value_t = 256)]
    height: usize,

    /// Output directory for the PNG and the summary JSON.
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Exemplar manifest JSON enabling continental amplification.
    #[arg(long)]
    exemplars: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            SimulationConfig::from_json(&text)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(samples) = args.samples {
        config.sample_count = samples;
    }

    let atlas = match &args.exemplars {
        Some(manifest) => {
            let root = manifest.parent().unwrap_or(std::path::Path::new("."));
            let library = ExemplarLibrary::load(manifest, root)
                .with_context(|| format!("loading exemplars {}", manifest.display()))?;
            let atlas = ExemplarAtlas::new();
            atlas.install(library);
            config.enable_continental_amplification = true;
            Some(atlas)
        }
        None => None,
    };

    let cache_dir = args.out.join("triangulation-cache");
    let mut sim = Simulation::with_disk_cache(config.clone(), Some(&cache_dir))?;
    info!(
        "running {} steps at {} samples (seed {})",
        args.steps, config.sample_count, config.seed
    );

    let mut last_step = None;
    for step in 0..args.steps {
        let metrics = sim.step(atlas.as_ref())?;
        info!(
            "step {}/{}: boundary edges={} convergent={} divergent={} rifts={} total={:.1}ms",
            step + 1,
            args.steps,
            metrics.boundary.num_edges,
            metrics.boundary.num_convergent,
            metrics.boundary.num_divergent,
            metrics.rifting.rifting_count,
            metrics.total_ms
        );
        last_step = Some(metrics);
    }

    let (path, export) = sim.export_heightmap(args.width, args.height, &args.out)?;
    println!("{}", path.display());

    let backend = match config.backend {
        lithos_core::Backend::Auto => "auto",
        lithos_core::Backend::Hull => "hull",
        lithos_core::Backend::Wheel => "wheel",
    };
    let step_summary = last_step
        .map(|m| {
            json!({
                "boundary_edges": m.boundary.num_edges,
                "convergent": m.boundary.num_convergent,
                "divergent": m.boundary.num_divergent,
                "transform": m.boundary.num_transform,
                "vertices_uplifted": m.subduction.vertices_touched,
                "max_uplift_m": m.subduction.max_uplift_m,
                "rifting_count": m.rifting.rifting_count,
            })
        })
        .unwrap_or_else(|| json!({}));

    write_summary(
        &args.out,
        "export",
        backend,
        config.sample_count,
        config.seed,
        json!({
            "pixel_count": export.pixel_count,
            "successful_samples": export.successful_samples,
            "failed_samples": export.failed_samples,
            "coverage_percent": export.coverage_percent,
            "mean_walk_steps": export.mean_walk_steps,
            "max_walk_steps": export.max_walk_steps,
            "seam": export.seam,
            "rescues": export.rescues,
            "used_amplified": export.used_amplified,
            "last_step": step_summary,
        }),
        json!({
            "sampling": export.sampling_ms,
            "encode": export.encode_ms,
            "total": export.total_ms,
        }),
    )?;

    Ok(())
}
