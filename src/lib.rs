//! # svs-rs
//!
//! Singing-voice synthesis from packaged singer models.
//!
//! A singer package bundles the neural models, configuration and speaker
//! data for one or more singers. An engine opens a package once — fixing the
//! inference backend for its sessions — and then renders any number of
//! structured scores (words, notes, phonemes, expressive control curves)
//! against the singers it provides.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! svs-rs = { version = "0.3", features = ["diffsinger"] }
//! ```
//!
//! ```ignore
//! use std::path::Path;
//! use svs_rs::{engines::diffsinger::{DiffSingerEngine, ScoreDocument}, SynthesisEngine};
//!
//! let mut engine = DiffSingerEngine::new();
//! engine.load_package(Path::new("singers/my-singer"), Default::default())?;
//! println!("package provides: {:?}", engine.singers());
//!
//! let score = ScoreDocument::load(Path::new("score.json"))?;
//! engine.render(&score)?.write_wav(Path::new("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engines;

use std::path::Path;

/// Mono audio produced by a render, at the sample rate the singer's acoustic
/// and vocoder models agreed on.
#[derive(Debug, Clone)]
pub struct RenderedAudio {
    /// Raw mono samples
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl RenderedAudio {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Write the audio as an IEEE-float-32 mono WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        self.samples
            .iter()
            .try_for_each(|&sample| writer.write_sample(sample))?;
        writer.finalize()
    }
}

/// A score-to-audio engine driving one loaded singer package.
///
/// The lifecycle is package-scoped: opening a package decides the backend
/// settings for every model session it spawns, and a loaded package can
/// serve renders for each singer it bundles. Which singer sings is part of
/// the score itself.
pub trait SynthesisEngine {
    /// Structured score consumed by the engine.
    type Score;
    /// Backend settings fixed when a package is opened (execution provider,
    /// device selection, ...).
    type Settings: Default;

    /// Open a singer package, replacing any previously loaded one.
    fn load_package(
        &mut self,
        package: &Path,
        settings: Self::Settings,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Release the loaded package and its backend sessions.
    fn unload_package(&mut self);

    /// Ids of the singers the loaded package provides.
    fn singers(&self) -> Vec<&str>;

    /// Render a score with the singer it names.
    fn render(&mut self, score: &Self::Score) -> Result<RenderedAudio, Box<dyn std::error::Error>>;
}
