//! Inspect checkpoints, prompts and tile layouts without loading a pipeline
//!
//! Usage: cargo run --bin sdforge -- prompt "a (red:1.3) cat BREAK garden"
//!        cargo run --bin sdforge -- tiles --height 512 --width 768

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

use sdforge::loaders::{self, CheckpointFormat};
use sdforge::prompt::{
    normalize_weights, parse_prompt_attention, resolve_schedule, split_on_break, split_prompts, WeightedSegment,
};
use sdforge::upscale::tile_offsets;
use sdforge::ModelFamily;

#[derive(Parser, Debug)]
#[command(author, version, about = "Diffusion pipeline tooling")]
struct Args {
    /// Options YAML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a checkpoint and report format, family and missing text encoders
    Inspect { name_or_path: String },
    /// Show how a prompt is scheduled, split and weighted
    Prompt {
        text: String,
        #[arg(long)]
        normalize: bool,
        #[arg(long, default_value_t = 20)]
        steps: usize,
        /// Model family used for sub-prompt splitting
        #[arg(long, default_value = "sdxl")]
        family: String,
    },
    /// Print tile offsets for an image of the given size
    Tiles {
        #[arg(long)]
        height: usize,
        #[arg(long)]
        width: usize,
        #[arg(long)]
        tile: Option<usize>,
        #[arg(long)]
        overlap: Option<usize>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    sdforge::logging::init_logger_with_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });

    let options = match &args.config {
        Some(path) => sdforge::load_options(path)?,
        None => sdforge::Options::default(),
    };

    match args.command {
        Command::Inspect { name_or_path } => inspect(&name_or_path),
        Command::Prompt { text, normalize, steps, family } => {
            let family = ModelFamily::detect_from_name(&family);
            show_prompt(&text, normalize || options.prompt.mean_norm, steps, family);
            Ok(())
        }
        Command::Tiles { height, width, tile, overlap } => {
            let tile = tile.unwrap_or(options.upscaler.tile_size).min(height).min(width);
            let overlap = overlap.unwrap_or(options.upscaler.tile_overlap);
            println!("tile={} overlap={}", tile, overlap);
            println!("rows: {:?}", tile_offsets(height, tile, overlap)?);
            println!("cols: {:?}", tile_offsets(width, tile, overlap)?);
            Ok(())
        }
    }
}

fn inspect(name_or_path: &str) -> Result<()> {
    let checkpoint = loaders::resolve(name_or_path)?;
    println!("name:   {}", checkpoint.name);
    println!("repo:   {}", checkpoint.repo_id);
    println!("format: {}", checkpoint.format);
    println!("family: {}", checkpoint.family);
    if checkpoint.size_bytes > 0 {
        println!("size:   {} MB", checkpoint.size_mb());
    }

    if let (CheckpointFormat::SingleFile, Some(path)) = (checkpoint.format, checkpoint.local_path()) {
        let keys = loaders::safetensor_keys(path)?;
        let missing = loaders::missing_components(&keys);
        if missing.is_empty() {
            println!("text encoders: bundled");
        } else {
            let names: Vec<&str> = missing.iter().map(|slot| slot.subfolder()).collect();
            println!("text encoders missing: {}", names.join(", "));
        }
        if let Some(repo) = checkpoint.family.fallback_repo(checkpoint.size_mb()) {
            println!("fallback repo: {}", repo);
        }
    }
    Ok(())
}

fn print_segments(label: &str, segments: &[WeightedSegment]) {
    println!("{}:", label);
    for segment in segments {
        println!("  {:>6.3}  {:?}", segment.weight, segment.text);
    }
}

fn show_prompt(text: &str, normalize: bool, steps: usize, family: ModelFamily) {
    let schedule = resolve_schedule(text, steps);
    if schedule.scheduled {
        println!("scheduled over {} steps, final: {:?}", steps, schedule.prompt);
    }

    let split = split_prompts(&schedule.prompt, family == ModelFamily::Sd3);
    println!("primary:   {:?}", split.primary);
    println!("secondary: {:?}", split.secondary);
    println!("tertiary:  {:?}", split.tertiary);

    let mut segments = parse_prompt_attention(&split.primary);
    if normalize {
        normalize_weights(&mut segments);
    }
    print_segments("weights", &segments);

    let chunks = split_on_break(&segments);
    if chunks.len() > 1 {
        for (i, chunk) in chunks.iter().enumerate() {
            print_segments(&format!("chunk {}", i), chunk);
        }
    }
}
