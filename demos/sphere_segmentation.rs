//! Segments a synthetic sphere with a thresholding scorer.
//!
//! The volume holds one channel that is 1.0 inside a sphere and 0.0 outside.
//! The scorer turns each tile into two classes, background `1 - x` and
//! foreground `x`, so the blended labels should reproduce the sphere exactly.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example sphere_segmentation -- [OPTIONS]
//! ```
//!
//! # Arguments
//!
//! * `-s, --size` - Edge length of the cubic volume (default: 40)
//! * `-c, --config` - JSON file with a `SlidingWindowConfig` to use instead of the built-in one
//! * `--timeout-secs` - Abort the pass after this many seconds (default: 60)
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=voxtile=debug cargo run --example sphere_segmentation -- --size 64 -c window.json
//! ```

use clap::Parser;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use voxtile::core::init_tracing;
use voxtile::prelude::*;
use voxtile::processors::dice;

/// Command-line arguments for the sphere segmentation example
#[derive(Parser)]
#[command(name = "sphere_segmentation")]
#[command(about = "Sliding-window segmentation of a synthetic sphere")]
struct Args {
    /// Edge length of the cubic volume
    #[arg(short, long, default_value_t = 40)]
    size: usize,

    /// JSON file with the sliding-window configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Abort the pass after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn sphere(size: usize) -> ArrayD<f32> {
    let centre = (size as f32 - 1.0) / 2.0;
    let radius = size as f32 / 3.0;
    ArrayD::from_shape_fn(IxDyn(&[1, size, size, size]), |idx| {
        let d2: f32 = (1..4).map(|a| (idx[a] as f32 - centre).powi(2)).sum();
        if d2.sqrt() <= radius { 1.0 } else { 0.0 }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = Args::parse();
    if args.size == 0 {
        return Err("--size must be positive".into());
    }

    let config = match &args.config {
        Some(path) => SlidingWindowConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SlidingWindowConfig::new(vec![16, 16, 16])
            .with_overlap(0.5)
            .with_batch_size(4)
            .with_labels(true)
            .with_accumulation(AccumulationStrategy::Partitioned { partitions: 4 }),
    };

    let inferer = SlidingWindowInferer::new(config.with_labels(true))?;
    let volume = sphere(args.size);
    let scorer = scorer_fn("threshold", |tiles: ArrayViewD<'_, f32>| {
        let foreground = tiles.to_owned();
        let background = tiles.mapv(|v| 1.0 - v);
        Ok(ndarray::concatenate(
            Axis(1),
            &[background.view(), foreground.view()],
        )?)
    });

    let cancel = CancellationToken::with_timeout(Duration::from_secs(args.timeout_secs));
    let output = inferer.infer_with_cancel(volume.view(), &scorer, &cancel)?;
    info!("{}", output.stats);

    let labels = output
        .labels
        .ok_or("the inferer was configured to emit labels")?;
    let target = volume.index_axis(Axis(0), 0).mapv(|v| usize::from(v > 0.5));
    let report = dice(labels.view(), target.view(), 2, true)?;

    println!("tiles:      {}", output.stats.tiles);
    println!("throughput: {:.1} tiles/s", output.stats.tiles_per_second());
    for (class, score) in report.per_class.iter().enumerate() {
        match score {
            Some(score) => println!("dice[{}]:    {:.4}", class, score),
            None => println!("dice[{}]:    absent", class),
        }
    }
    println!("{}", inferer.stats());
    Ok(())
}
