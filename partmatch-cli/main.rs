use anyhow::Context;
use clap::{Parser, Subcommand};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use partmatch_cli::{index_directory, Analyzer, CatalogItem, EngineConfig, MatchResult, MatchingEngine, SiftExtractor};
use partmatch_core::{default_threads, init_thread_pool};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Identify spare parts from photos by local feature matching
#[derive(Parser, Debug)]
#[command(name = "partmatch")]
#[command(about = "Identify spare parts from photos", long_about = None)]
struct Args {
    /// Engine configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Worker threads
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Features file of the store
    #[arg(long, global = true)]
    features: Option<PathBuf>,

    /// Mapping file of the store
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the feature store from a directory of reference images
    Index {
        /// Directory searched recursively for images
        images: PathBuf,
    },

    /// Identify the part shown in an image
    Analyze {
        image: PathBuf,

        /// JSON array of catalog items; defaults to the items in the store
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extract features from an image and report them
    Inspect {
        image: PathBuf,

        /// Write a copy of the image with keypoints drawn on it
        #[arg(long)]
        draw: Option<PathBuf>,

        /// Use the indexing preprocessing instead of the query settings
        #[arg(long)]
        indexing: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(features) = &args.features {
        config.store.features = features.clone();
    }
    if let Some(mapping) = &args.mapping {
        config.store.mapping = mapping.clone();
    }

    let threads = args.threads.or(config.threads).unwrap_or_else(default_threads);
    init_thread_pool(threads)?;
    info!("partmatch v{} using {} threads", env!("CARGO_PKG_VERSION"), threads);

    match args.command {
        Command::Index { images } => run_index(&images, &config),
        Command::Analyze { image, catalog, json } => run_analyze(&image, catalog.as_deref(), json, &config),
        Command::Inspect { image, draw, indexing } => run_inspect(&image, draw.as_deref(), indexing, &config),
    }
}

fn run_index(images: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let t0 = Instant::now();
    let summary = index_directory(images, &config.store, &config.indexing)
        .with_context(|| format!("indexing {}", images.display()))?;

    println!("Indexed {} images in {:.2?}", summary.indexed, t0.elapsed());
    for (path, reason) in &summary.skipped {
        println!("  skipped {}: {}", path.display(), reason);
    }
    println!("Features: {}", config.store.features.display());
    println!("Mapping:  {}", config.store.mapping.display());
    Ok(())
}

fn run_analyze(image: &Path, catalog: Option<&Path>, json: bool, config: &EngineConfig) -> anyhow::Result<()> {
    let engine = MatchingEngine::from_config(config)?;
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;

    let catalog: Vec<CatalogItem> = match catalog {
        Some(path) => {
            let text = std::fs::read(path).with_context(|| format!("reading catalog {}", path.display()))?;
            serde_json::from_slice(&text).with_context(|| format!("parsing catalog {}", path.display()))?
        }
        None => engine.store_catalog(),
    };

    let t0 = Instant::now();
    let results = engine.analyze(&bytes, &catalog);
    info!(results = results.len(), elapsed = ?t0.elapsed(), "analysis finished");

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_table(&results);
    }
    Ok(())
}

fn print_table(results: &[MatchResult]) {
    if results.is_empty() {
        println!("No candidates");
        return;
    }
    println!("{:<20} {:>10}  REASON", "MATERIAL", "CONFIDENCE");
    for r in results {
        println!("{:<20} {:>10.3}  {}", r.item_id, r.confidence_score, r.explanation);
    }
}

fn run_inspect(image: &Path, draw: Option<&Path>, indexing: bool, config: &EngineConfig) -> anyhow::Result<()> {
    let sift = if indexing { &config.indexing.sift } else { &config.sift };
    let extractor = SiftExtractor::new(sift.clone())?;

    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let img = partmatch_sift::decode(&bytes)?;
    let gray = img.to_luma8();

    let t0 = Instant::now();
    let (keypoints, descriptors) = extractor.detect_and_describe(&gray);
    let elapsed = t0.elapsed();

    println!("{}", sift.summary());
    println!("Image: {}x{}", gray.width(), gray.height());
    println!("Time taken: {:.2?}", elapsed);
    println!("Detected {} keypoints", keypoints.len());
    println!("Generated {} descriptors", descriptors.len());
    if keypoints.len() < partmatch_core::MIN_KEYPOINTS {
        println!("Too few keypoints to be matched");
    }

    if let Some(out) = draw {
        let mut output: RgbaImage = image::DynamicImage::ImageLuma8(gray).into_rgba8();
        let red = Rgba([255, 0, 0, 255]);
        for kp in &keypoints {
            let radius = (kp.size / 2.0).max(2.0);
            draw_hollow_circle_mut(&mut output, (kp.x as i32, kp.y as i32), radius as i32, red);

            let (sin, cos) = kp.angle.to_radians().sin_cos();
            let tip = (kp.x + radius * cos, kp.y - radius * sin);
            draw_line_segment_mut(&mut output, (kp.x, kp.y), tip, red);
        }
        output.save(out).with_context(|| format!("writing {}", out.display()))?;
        println!("Saved keypoint image as {}", out.display());
    }
    Ok(())
}
