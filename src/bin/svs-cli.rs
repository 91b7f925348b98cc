use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use svs_rs::engines::diffsinger::{
    DiffSingerEngine, DiffSingerSettings, ExecutionProvider, ScoreDocument,
};
use svs_rs::SynthesisEngine;

/// Render a score with a packaged singer.
#[derive(Parser, Debug)]
#[command(name = "svs-cli", version, about)]
struct Cli {
    /// Singer package directory
    package: PathBuf,
    /// Score input JSON
    input: PathBuf,
    /// Output WAV path
    output_wav: PathBuf,
    /// Execution provider: cpu, dml, directml, cuda, coreml
    #[arg(default_value = "cpu")]
    ep: String,
    /// Device index for GPU providers
    #[arg(default_value_t = 0)]
    device_index: i32,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage problems (including --help/--version) print and exit 1.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            // Mirrors the conventional -1 of the native tools.
            ExitCode::from(255)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Unrecognized provider names fall back to the CPU.
    let provider = ExecutionProvider::parse(&cli.ep).unwrap_or_default();
    if provider == ExecutionProvider::Cpu && !cli.ep.eq_ignore_ascii_case("cpu") {
        log::warn!("unknown execution provider \"{}\", using cpu", cli.ep);
    }

    let score = ScoreDocument::load(&cli.input)
        .with_context(|| format!("failed to read input file \"{}\"", cli.input.display()))?;

    let mut engine = DiffSingerEngine::new();
    engine
        .load_package(
            &cli.package,
            DiffSingerSettings {
                provider,
                device_index: cli.device_index,
            },
        )
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to open package \"{}\"", cli.package.display()))?;

    let audio = engine
        .render(&score)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to render singer \"{}\"", score.singer))?;

    audio
        .write_wav(&cli.output_wav)
        .with_context(|| format!("failed to write \"{}\"", cli.output_wav.display()))?;

    log::info!(
        "saved {:.2}s of audio to {}",
        audio.duration_secs(),
        cli.output_wav.display()
    );
    Ok(())
}
