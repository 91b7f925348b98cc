//! Singing-voice synthesis engines.
//!
//! This module contains implementations of score-to-audio engines.
//!
//! # Available Engines
//!
//! Enable engines via Cargo features:
//! - `diffsinger` - DiffSinger-style packaged singers (ONNX format)

#[cfg(feature = "diffsinger")]
pub mod diffsinger;
