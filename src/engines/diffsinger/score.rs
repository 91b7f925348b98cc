//! Score data model: words, notes, phonemes and expressive control curves.
//!
//! A [`ScoreDocument`] is the JSON input of a render: the singer id plus the
//! ordered word list, parameter curves, speaker mix curves and sampling
//! controls. The duration stage fills phoneme start times in place, the pitch
//! and variance stages replace or append parameter curves, and the acoustic
//! stage consumes the final document.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{DiffSingerError, Result};

/// Tag identifying a parameter time series.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ParamTag {
    Pitch,
    F0,
    ToneShift,
    Expr,
    Energy,
    Breathiness,
    Voicing,
    Tension,
    MouthOpening,
    Gender,
    Velocity,
}

impl ParamTag {
    /// Variance parameters a variance model may predict.
    pub const VARIANCE: [ParamTag; 5] = [
        ParamTag::Energy,
        ParamTag::Breathiness,
        ParamTag::Voicing,
        ParamTag::Tension,
        ParamTag::MouthOpening,
    ];

    /// Transition parameters modulating the acoustic model.
    pub const TRANSITION: [ParamTag; 2] = [ParamTag::Gender, ParamTag::Velocity];

    /// Machine name used as the model input name and in configuration files.
    pub fn name(self) -> &'static str {
        match self {
            ParamTag::Pitch => "pitch",
            ParamTag::F0 => "f0",
            ParamTag::ToneShift => "tone_shift",
            ParamTag::Expr => "expr",
            ParamTag::Energy => "energy",
            ParamTag::Breathiness => "breathiness",
            ParamTag::Voicing => "voicing",
            ParamTag::Tension => "tension",
            ParamTag::MouthOpening => "mouth_opening",
            ParamTag::Gender => "gender",
            ParamTag::Velocity => "velocity",
        }
    }

    pub fn is_variance(self) -> bool {
        Self::VARIANCE.contains(&self)
    }

    pub fn is_transition(self) -> bool {
        Self::TRANSITION.contains(&self)
    }
}

/// A musical note within a word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// MIDI key number
    pub key: i64,
    /// Signed cent offset from the key
    #[serde(default)]
    pub cents: i64,
    /// Duration in seconds
    pub duration: f64,
    #[serde(default)]
    pub is_rest: bool,
}

/// A speaker mixing weight attached to a phoneme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerWeight {
    pub name: String,
    pub proportion: f64,
}

/// A phoneme within a word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phone {
    pub token: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Start time in seconds relative to the word, filled by the duration
    /// stage when the score leaves it at zero.
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub speakers: Vec<SpeakerWeight>,
}

/// An ordered group of notes and the phonemes sung over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub notes: Vec<Note>,
    pub phones: Vec<Phone>,
}

impl Word {
    /// Total note duration of this word, in seconds.
    pub fn duration(&self) -> f64 {
        self.notes.iter().map(|n| n.duration).sum()
    }
}

/// Time window, in seconds, of a parameter region to be regenerated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Retake {
    pub start: f64,
    pub end: f64,
}

/// A tagged parameter time series sampled at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub tag: ParamTag,
    pub values: Vec<f64>,
    /// Seconds per sample
    pub interval: f64,
    #[serde(default)]
    pub retake: Option<Retake>,
}

/// A per-speaker proportion curve sampled at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerCurve {
    pub name: String,
    pub values: Vec<f64>,
    /// Seconds per sample
    pub interval: f64,
}

fn default_steps() -> i64 {
    20
}

/// The top-level render input document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDocument {
    pub singer: String,
    /// Total score duration in seconds
    pub duration: f64,
    pub words: Vec<Word>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub speakers: Vec<SpeakerCurve>,
    #[serde(default = "default_steps")]
    pub steps: i64,
    #[serde(default)]
    pub depth: f64,
}

impl ScoreDocument {
    /// Load and validate a score document from a JSON file.
    pub fn load(path: &Path) -> Result<ScoreDocument> {
        let text = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiffSingerError::FileNotFound(path.to_path_buf())
            } else {
                DiffSingerError::Io(e)
            }
        })?;
        let doc: ScoreDocument = serde_json::from_str(&text)
            .map_err(|e| DiffSingerError::InvalidFormat(e.to_string()))?;
        if doc.singer.is_empty() {
            return Err(DiffSingerError::InvalidFormat(
                "empty singer field".to_string(),
            ));
        }
        Ok(doc)
    }
}

/// Total phoneme count across all words.
pub fn phone_count(words: &[Word]) -> usize {
    words.iter().map(|w| w.phones.len()).sum()
}

/// Total note count across all words.
pub fn note_count(words: &[Word]) -> usize {
    words.iter().map(|w| w.notes.len()).sum()
}

/// Total duration of all words, in seconds.
pub fn total_duration(words: &[Word]) -> f64 {
    words.iter().map(|w| w.duration()).sum()
}

#[cfg(test)]
mod tests {
    use super::{ParamTag, ScoreDocument};

    #[test]
    fn param_tags_use_machine_names_in_json() {
        let json = serde_json::to_string(&ParamTag::ToneShift).unwrap();
        assert_eq!(json, "\"tone_shift\"");
        let tag: ParamTag = serde_json::from_str("\"mouth_opening\"").unwrap();
        assert_eq!(tag, ParamTag::MouthOpening);
        assert_eq!(ParamTag::F0.name(), "f0");
    }

    #[test]
    fn parses_minimal_document() {
        let json = r#"{
            "singer": "opencpop",
            "duration": 1.5,
            "words": [{
                "notes": [{"key": 69, "duration": 1.5}],
                "phones": [{"token": "a"}]
            }],
            "parameters": [
                {"tag": "pitch", "values": [69.0, 69.0], "interval": 0.75,
                 "retake": {"start": 0.0, "end": 0.75}}
            ]
        }"#;
        let doc: ScoreDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.singer, "opencpop");
        assert_eq!(doc.steps, 20);
        assert_eq!(doc.words[0].duration(), 1.5);
        assert!(doc.parameters[0].retake.is_some());
        assert!(!doc.words[0].notes[0].is_rest);
    }

    #[test]
    fn counting_helpers() {
        let json = r#"{
            "singer": "s", "duration": 2.0,
            "words": [
                {"notes": [{"key": 60, "duration": 1.0}],
                 "phones": [{"token": "k"}, {"token": "a"}]},
                {"notes": [{"key": 62, "duration": 0.5}, {"key": 64, "duration": 0.5}],
                 "phones": [{"token": "i"}]}
            ]
        }"#;
        let doc: ScoreDocument = serde_json::from_str(json).unwrap();
        assert_eq!(super::phone_count(&doc.words), 3);
        assert_eq!(super::note_count(&doc.words), 3);
        assert!((super::total_duration(&doc.words) - 2.0).abs() < 1e-12);
    }
}
