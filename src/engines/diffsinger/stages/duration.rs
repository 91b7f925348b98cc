//! Duration stage: predicts how long each phoneme is sung.
//!
//! Runs the linguistic encoder in word mode, feeds the predictor the
//! per-phoneme note pitch, and rescales the raw predictions so every word
//! keeps its scored duration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::engines::diffsinger::config::DurationConfig;
use crate::engines::diffsinger::driver::{
    InferenceDriver, InferenceSession, SessionOpenArgs, SessionRunInput,
};
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::linguistic;
use crate::engines::diffsinger::package::InferenceSpec;
use crate::engines::diffsinger::preprocess;
use crate::engines::diffsinger::score::{phone_count, Word};
use crate::engines::diffsinger::tensor::{DType, Tensor};

use super::{check_init_args, read_lock, write_lock, StageKind, StateCell, TaskInitArgs, TaskState};

pub struct DurationStartInput<'a> {
    pub words: &'a [Word],
}

#[derive(Debug, Clone)]
pub struct DurationResult {
    /// Predicted duration in seconds for every phoneme, in score order.
    pub durations: Vec<f64>,
}

struct Inner {
    encoder: Option<Box<dyn InferenceSession>>,
    predictor: Option<Box<dyn InferenceSession>>,
    result: Option<Arc<DurationResult>>,
}

pub struct DurationInference {
    spec: Arc<InferenceSpec>,
    driver: Arc<dyn InferenceDriver>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl DurationInference {
    pub fn new(spec: Arc<InferenceSpec>, driver: Arc<dyn InferenceDriver>) -> DurationInference {
        DurationInference {
            spec,
            driver,
            state: StateCell::new(),
            inner: RwLock::new(Inner {
                encoder: None,
                predictor: None,
                result: None,
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn result(&self) -> Option<Arc<DurationResult>> {
        read_lock(&self.inner).result.clone()
    }

    /// Open the encoder and predictor sessions. Clears any previous result.
    pub fn initialize(&self, args: &TaskInitArgs) -> Result<()> {
        let outcome = self.do_initialize(args);
        if outcome.is_err() {
            self.state.set(TaskState::Failed);
        }
        outcome
    }

    fn do_initialize(&self, args: &TaskInitArgs) -> Result<()> {
        check_init_args(StageKind::Duration, args)?;
        let config = self.spec.duration_config()?;

        let mut inner = write_lock(&self.inner);
        inner.result = None;

        let mut encoder = self.driver.create_session();
        encoder.open(&config.encoder, &SessionOpenArgs::default())?;
        let mut predictor = self.driver.create_session();
        predictor.open(&config.predictor, &SessionOpenArgs::default())?;
        inner.encoder = Some(encoder);
        inner.predictor = Some(predictor);
        drop(inner);

        self.state.set(TaskState::Idle);
        Ok(())
    }

    pub fn start(&self, input: &DurationStartInput<'_>) -> Result<Arc<DurationResult>> {
        {
            let inner = read_lock(&self.inner);
            if inner.encoder.is_none() || inner.predictor.is_none() {
                self.state.set(TaskState::Failed);
                return Err(DiffSingerError::Session(
                    "duration inference is not initialized".to_string(),
                ));
            }
        }
        self.state.set(TaskState::Running);
        match self.run(input) {
            Ok(result) => {
                self.state.set(TaskState::Idle);
                Ok(result)
            }
            Err(e) => {
                self.state.set(TaskState::Failed);
                Err(e)
            }
        }
    }

    pub fn start_async(&self, _input: &DurationStartInput<'_>) -> Result<()> {
        Err(DiffSingerError::NotImplemented("asynchronous stage start"))
    }

    pub fn stop(&self) -> bool {
        let inner = read_lock(&self.inner);
        let mut accepted = true;
        for session in [&inner.encoder, &inner.predictor] {
            if let Some(session) = session {
                accepted &= session.stop();
            }
        }
        drop(inner);
        self.state.set(TaskState::Terminated);
        accepted
    }

    fn run(&self, input: &DurationStartInput<'_>) -> Result<Arc<DurationResult>> {
        let config = self.spec.duration_config()?;
        let words = input.words;
        let frame_width = config.frame_width;
        if !frame_width.is_finite() || frame_width <= 0.0 {
            return Err(DiffSingerError::InvalidArgument(
                "frame width must be positive".to_string(),
            ));
        }

        let mut predictor_input = SessionRunInput::new();

        // Part 1: linguistic encoder
        let encoder_input = linguistic::preprocess_linguistic_word(
            words,
            &config.phonemes,
            &config.languages,
            config.use_language_id,
            frame_width,
        )?;
        {
            let mut inner = write_lock(&self.inner);
            let encoder = inner
                .encoder
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session(
                        "duration linguistic encoder session is not initialized".to_string(),
                    )
                })?;
            linguistic::run_encoder(encoder.as_mut(), encoder_input, &mut predictor_input, true)?;
        }

        // Part 2: duration predictor
        predictor_input.input("ph_midi", preprocess_phoneme_midi(words)?);
        if config.use_speaker_embedding {
            predictor_input.input(
                "spk_embed",
                speaker_embedding_phones(words, config, &self.spec.options.speaker_mapping)?,
            );
        }
        predictor_input.output("ph_dur_pred");

        let session_result = {
            let mut inner = write_lock(&self.inner);
            let predictor = inner
                .predictor
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session(
                        "duration predictor session is not initialized".to_string(),
                    )
                })?;
            predictor.run(&predictor_input)?
        };

        let Some(output) = session_result.outputs.get("ph_dur_pred") else {
            return Err(DiffSingerError::Session("invalid result output".to_string()));
        };
        let view = output
            .view::<f32>()
            .map_err(|_| DiffSingerError::Session("model output is not float".to_string()))?;
        if view.is_empty() {
            return Err(DiffSingerError::Session("model output is empty".to_string()));
        }
        let mut durations: Vec<f64> = view.iter().map(|&v| v as f64).collect();

        // Scale the predictions so each word keeps its scored duration.
        let mut begin = 0usize;
        for word in words {
            if word.phones.is_empty() {
                return Err(DiffSingerError::Session(
                    "error scaling duration results: index out of bounds".to_string(),
                ));
            }
            let end = begin + word.phones.len();
            if begin >= durations.len() || end > durations.len() {
                break;
            }
            let predicted: f64 = durations[begin..end].iter().sum();
            if predicted == 0.0 || !predicted.is_finite() {
                return Err(DiffSingerError::Session(format!(
                    "error scaling duration results: invalid predicted word duration: {}",
                    predicted
                )));
            }
            let scale = word.duration() / predicted;
            for value in &mut durations[begin..end] {
                *value *= scale;
            }
            begin = end;
        }

        let expected = phone_count(words);
        if durations.len() != expected {
            return Err(DiffSingerError::Session(format!(
                "predicted phoneme count mismatch: expected {}, got {}",
                expected,
                durations.len()
            )));
        }

        let result = Arc::new(DurationResult { durations });
        write_lock(&self.inner).result = Some(result.clone());
        Ok(result)
    }
}

/// For each phoneme, the pitch of the note playing at its start time; rests
/// become the nearest non-rest pitch of the same word.
fn preprocess_phoneme_midi(words: &[Word]) -> Result<Tensor> {
    let mut midi: Vec<i64> = Vec::with_capacity(phone_count(words));
    let mut rest: Vec<bool> = Vec::with_capacity(phone_count(words));
    for word in words {
        if word.notes.is_empty() {
            continue;
        }
        let mut cumulative = Vec::with_capacity(word.notes.len());
        let mut sum = 0.0;
        for note in &word.notes {
            sum += note.duration;
            cumulative.push(sum);
        }

        for phone in &word.phones {
            let mut index = 0;
            while index < cumulative.len() && phone.start > cumulative[index] {
                index += 1;
            }
            if index >= word.notes.len() {
                index = word.notes.len() - 1;
            }
            let note = &word.notes[index];
            rest.push(note.is_rest);
            midi.push(if note.is_rest { 0 } else { note.key });
        }
        // Fill over the accumulated sequence, so a fully-rest word borrows
        // the nearest pitch from its neighbors.
        if !preprocess::fill_rest_midi_with_nearest(&mut midi, &rest) {
            return Err(DiffSingerError::Session("failed to fill rest notes".to_string()));
        }
    }
    let shape = vec![1, midi.len() as i64];
    Tensor::from_vec(shape, midi)
}

/// Mix per-phoneme speaker embeddings into a `1 x phoneCount x hiddenSize`
/// tensor. Every phoneme must carry at least one speaker entry.
fn speaker_embedding_phones(
    words: &[Word],
    config: &DurationConfig,
    speaker_mapping: &HashMap<String, String>,
) -> Result<Tensor> {
    let hidden = config.hidden_size as usize;
    let count = phone_count(words);
    let mut tensor = Tensor::zeros(DType::Float, vec![1, count as i64, config.hidden_size])?;
    let buffer = tensor.data_mut::<f32>()?;
    let mut index = 0usize;
    for word in words {
        for phone in &word.phones {
            if phone.speakers.is_empty() {
                return Err(DiffSingerError::Session(format!(
                    "phoneme {} missing speakers",
                    phone.token
                )));
            }
            for speaker in &phone.speakers {
                let name = speaker_mapping.get(&speaker.name).unwrap_or(&speaker.name);
                if let Some(embedding) = config.speakers.get(name) {
                    if embedding.len() != hidden {
                        return Err(DiffSingerError::Session(
                            "speaker embedding vector length does not match hiddenSize".to_string(),
                        ));
                    }
                    let row = &mut buffer[index * hidden..(index + 1) * hidden];
                    for (value, &weight) in row.iter_mut().zip(embedding) {
                        *value += speaker.proportion as f32 * weight;
                    }
                }
            }
            index += 1;
        }
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::diffsinger::config::ImportOptions;
    use crate::engines::diffsinger::package::StageConfig;
    use crate::engines::diffsinger::score::{Note, Phone};
    use crate::engines::diffsinger::stages::testing::MockDriver;

    fn phone(token: &str, start: f64) -> Phone {
        Phone {
            token: token.to_string(),
            language: None,
            start,
            speakers: Vec::new(),
        }
    }

    fn words() -> Vec<Word> {
        vec![
            Word {
                notes: vec![Note {
                    key: 60,
                    cents: 0,
                    duration: 1.5,
                    is_rest: false,
                }],
                phones: vec![phone("k", 0.0), phone("a", 0.4)],
            },
            Word {
                notes: vec![
                    Note {
                        key: 0,
                        cents: 0,
                        duration: 0.2,
                        is_rest: true,
                    },
                    Note {
                        key: 64,
                        cents: 0,
                        duration: 0.5,
                        is_rest: false,
                    },
                ],
                phones: vec![phone("i", 0.3)],
            },
        ]
    }

    fn spec() -> Arc<InferenceSpec> {
        let mut config = DurationConfig::default();
        for (i, token) in ["k", "a", "i"].iter().enumerate() {
            config.phonemes.insert(token.to_string(), i as i64 + 1);
        }
        config.frame_width = 0.01;
        config.encoder = "linguistic.onnx".into();
        config.predictor = "dur.onnx".into();
        Arc::new(InferenceSpec {
            kind: StageKind::Duration,
            config: StageConfig::Duration(config),
            schema: None,
            options: ImportOptions::default(),
        })
    }

    fn driver_with_predictions(values: Vec<f32>) -> Arc<MockDriver> {
        let len = values.len() as i64;
        Arc::new(
            MockDriver::new()
                .with_output("encoder_out", Tensor::filled(vec![1, 3, 8], 0.5f32).unwrap())
                .with_output("x_masks", Tensor::filled(vec![1, 3], false).unwrap())
                .with_output(
                    "ph_dur_pred",
                    Tensor::from_vec(vec![1, len], values).unwrap(),
                ),
        )
    }

    #[test]
    fn rejects_wrong_init_args() {
        let stage = DurationInference::new(spec(), driver_with_predictions(vec![1.0]));
        let err = stage.initialize(&TaskInitArgs::Pitch).unwrap_err();
        assert!(err.to_string().contains("expected \"duration\""));
        assert_eq!(stage.state(), TaskState::Failed);
    }

    #[test]
    fn start_without_initialize_fails() {
        let stage = DurationInference::new(spec(), driver_with_predictions(vec![1.0]));
        let words = words();
        let err = stage
            .start(&DurationStartInput { words: &words })
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        assert_eq!(stage.state(), TaskState::Failed);
    }

    #[test]
    fn scales_predictions_to_word_durations() {
        let driver = driver_with_predictions(vec![2.0, 4.0, 1.0]);
        let stage = DurationInference::new(spec(), driver.clone());
        stage.initialize(&TaskInitArgs::Duration).unwrap();
        assert_eq!(stage.state(), TaskState::Idle);

        let words = words();
        let result = stage.start(&DurationStartInput { words: &words }).unwrap();
        assert_eq!(stage.state(), TaskState::Idle);

        // Word 1 lasts 1.5s, word 2 lasts 0.7s.
        assert!((result.durations[0] - 0.5).abs() < 1e-9);
        assert!((result.durations[1] - 1.0).abs() < 1e-9);
        assert!((result.durations[2] - 0.7).abs() < 1e-9);
        let word1: f64 = result.durations[..2].iter().sum();
        assert!((word1 - 1.5).abs() < 1e-9);

        // The predictor saw the rest note replaced by the nearest pitch and
        // the encoder outputs forwarded unchanged.
        let run = driver.run_requesting("ph_dur_pred");
        assert_eq!(run.inputs["ph_midi"].view::<i64>().unwrap(), &[60, 60, 64]);
        assert!(run.inputs.contains_key("encoder_out"));
        assert!(run.inputs.contains_key("x_masks"));
        assert!(!run.inputs.contains_key("spk_embed"));

        assert!(stage.result().is_some());
    }

    #[test]
    fn rest_note_borrows_pitch_from_preceding_word() {
        let driver = driver_with_predictions(vec![1.0, 1.0]);
        let stage = DurationInference::new(spec(), driver.clone());
        stage.initialize(&TaskInitArgs::Duration).unwrap();
        let words = vec![
            Word {
                notes: vec![Note {
                    key: 60,
                    cents: 0,
                    duration: 0.5,
                    is_rest: false,
                }],
                phones: vec![phone("k", 0.0)],
            },
            Word {
                notes: vec![Note {
                    key: 0,
                    cents: 0,
                    duration: 0.5,
                    is_rest: true,
                }],
                phones: vec![phone("i", 0.0)],
            },
        ];
        stage.start(&DurationStartInput { words: &words }).unwrap();
        let run = driver.run_requesting("ph_dur_pred");
        assert_eq!(run.inputs["ph_midi"].view::<i64>().unwrap(), &[60, 60]);
    }

    #[test]
    fn prediction_count_mismatch_fails() {
        let driver = driver_with_predictions(vec![2.0, 4.0]);
        let stage = DurationInference::new(spec(), driver);
        stage.initialize(&TaskInitArgs::Duration).unwrap();
        let words = words();
        let err = stage
            .start(&DurationStartInput { words: &words })
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("predicted phoneme count mismatch: expected 3, got 2"));
        assert_eq!(stage.state(), TaskState::Failed);
    }

    #[test]
    fn zero_prediction_sum_fails() {
        let driver = driver_with_predictions(vec![0.0, 0.0, 1.0]);
        let stage = DurationInference::new(spec(), driver);
        stage.initialize(&TaskInitArgs::Duration).unwrap();
        let words = words();
        let err = stage
            .start(&DurationStartInput { words: &words })
            .unwrap_err();
        assert!(err.to_string().contains("invalid predicted word duration"));
    }

    #[test]
    fn stop_terminates() {
        let stage = DurationInference::new(spec(), driver_with_predictions(vec![1.0]));
        stage.initialize(&TaskInitArgs::Duration).unwrap();
        assert!(stage.stop());
        assert_eq!(stage.state(), TaskState::Terminated);
    }
}
