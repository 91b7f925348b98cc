//! DiffSinger-style singing-voice synthesis engine.
//!
//! This module renders a structured musical score into audio with a packaged
//! singer: four neural models plus a vocoder, driven in order and exchanging
//! intermediate results through the score document.
//!
//! # Pipeline
//!
//! | Stage | Consumes | Produces |
//! |---|---|---|
//! | Duration | words, phonemes, note pitch | per-phoneme durations (start times filled into the score) |
//! | Pitch | notes, phoneme durations, user pitch + retake | per-frame pitch curve (replaces the score's pitch parameter) |
//! | Variance | pitch, declared variance curves | predicted variance parameters (merged into the score) |
//! | Acoustic | full score, F0 | mel spectrogram + F0 tensor |
//! | Vocoder | mel + F0 | waveform |
//!
//! # Package Layout
//!
//! A singer package is a directory with a `package.json` descriptor, one
//! configuration file per stage, the referenced `.onnx` models, phoneme and
//! language id maps, and raw `.emb` speaker embedding files. See
//! [`package`] for the descriptor format.
//!
//! # Example
//!
//! ```rust,no_run
//! use svs_rs::{SynthesisEngine, engines::diffsinger::{DiffSingerEngine, ScoreDocument}};
//! use std::path::Path;
//!
//! let mut engine = DiffSingerEngine::new();
//! engine.load_package(Path::new("singers/my-singer"), Default::default())?;
//! println!("singers: {:?}", engine.singers());
//!
//! let score = ScoreDocument::load(Path::new("score.json"))?;
//! engine.render(&score)?.write_wav(Path::new("out.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod dict;
pub mod driver;
pub mod engine;
pub mod error;
pub mod linguistic;
pub mod package;
pub mod pipeline;
pub mod preprocess;
pub mod score;
pub mod stages;
pub mod tensor;

pub use config::{ImportOptions, LinguisticMode, MelBase, MelScale, VarianceSchema};
pub use dict::PhonemeDict;
pub use driver::{ExecutionProvider, InferenceDriver, InferenceSession, OrtDriver};
pub use engine::{DiffSingerEngine, DiffSingerRenderOptions, DiffSingerSettings};
pub use error::{DiffSingerError, Result};
pub use package::{SingerPack, SingerSpec};
pub use score::{ParamTag, Parameter, ScoreDocument};
pub use stages::{StageKind, TaskState};
pub use tensor::{DType, Tensor};
