//! Command line driver: `hoof <namelist> <input_dir> <output_dir>`

use anyhow::{bail, Context, Result};
use clap::Parser;
use hoof::{run_batch, Settings};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hoof")]
#[command(about = "Homogenize, dealias and superob ODIM_H5 radar volumes")]
#[command(after_help = "The last five characters of each file name must hold the OPERA site code.")]
struct Cli {
    /// Namelist with processing settings
    namelist: PathBuf,

    /// Folder with the input volumes
    input_dir: PathBuf,

    /// Folder receiving the processed volumes and per-file logs
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let settings = Settings::from_file(&cli.namelist)
        .with_context(|| format!("Failed to read namelist {}", cli.namelist.display()))?;
    if !cli.input_dir.is_dir() {
        bail!("Input folder {} does not exist", cli.input_dir.display());
    }
    if !cli.output_dir.is_dir() {
        bail!("Output folder {} does not exist", cli.output_dir.display());
    }

    let summary = run_batch(&settings, &cli.input_dir, &cli.output_dir)?;
    println!("{}", summary);
    Ok(())
}
