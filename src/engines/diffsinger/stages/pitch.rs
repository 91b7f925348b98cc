//! Pitch stage: predicts the per-frame pitch curve.
//!
//! The predictor is conditioned on the note sequence (pitch, rests,
//! frame-snapped durations), the phoneme durations, the user's pitch curve
//! with its retake mask, and optionally expressiveness, speaker embedding and
//! acceleration controls.

use std::sync::{Arc, RwLock};

use crate::engines::diffsinger::config::LinguisticMode;
use crate::engines::diffsinger::driver::{
    InferenceDriver, InferenceSession, SessionOpenArgs, SessionRunInput,
};
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::linguistic;
use crate::engines::diffsinger::package::InferenceSpec;
use crate::engines::diffsinger::preprocess;
use crate::engines::diffsinger::score::{ParamTag, Parameter, SpeakerCurve, Word};
use crate::engines::diffsinger::tensor::Tensor;

use super::{check_init_args, read_lock, write_lock, StageKind, StateCell, TaskInitArgs, TaskState};

pub struct PitchStartInput<'a> {
    pub words: &'a [Word],
    pub parameters: &'a [Parameter],
    pub speakers: &'a [SpeakerCurve],
    pub steps: i64,
}

#[derive(Debug, Clone)]
pub struct PitchResult {
    /// Seconds per pitch sample
    pub interval: f64,
    /// Predicted MIDI-space pitch per frame
    pub pitch: Vec<f64>,
}

struct Inner {
    encoder: Option<Box<dyn InferenceSession>>,
    predictor: Option<Box<dyn InferenceSession>>,
    result: Option<Arc<PitchResult>>,
}

pub struct PitchInference {
    spec: Arc<InferenceSpec>,
    driver: Arc<dyn InferenceDriver>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl PitchInference {
    pub fn new(spec: Arc<InferenceSpec>, driver: Arc<dyn InferenceDriver>) -> PitchInference {
        PitchInference {
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

    pub fn result(&self) -> Option<Arc<PitchResult>> {
        read_lock(&self.inner).result.clone()
    }

    pub fn initialize(&self, args: &TaskInitArgs) -> Result<()> {
        let outcome = self.do_initialize(args);
        if outcome.is_err() {
            self.state.set(TaskState::Failed);
        }
        outcome
    }

    fn do_initialize(&self, args: &TaskInitArgs) -> Result<()> {
        check_init_args(StageKind::Pitch, args)?;
        let config = self.spec.pitch_config()?;

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

    pub fn start(&self, input: &PitchStartInput<'_>) -> Result<Arc<PitchResult>> {
        {
            let inner = read_lock(&self.inner);
            if inner.encoder.is_none() || inner.predictor.is_none() {
                self.state.set(TaskState::Failed);
                return Err(DiffSingerError::Session(
                    "pitch inference is not initialized".to_string(),
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

    pub fn start_async(&self, _input: &PitchStartInput<'_>) -> Result<()> {
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

    fn run(&self, input: &PitchStartInput<'_>) -> Result<Arc<PitchResult>> {
        let config = self.spec.pitch_config()?;
        let words = input.words;
        let frame_width = config.frame_width;
        if !frame_width.is_finite() || frame_width <= 0.0 {
            return Err(DiffSingerError::InvalidArgument(
                "frame width must be positive".to_string(),
            ));
        }

        let mut predictor_input = SessionRunInput::new();

        // Part 1: linguistic encoder
        let encoder_input = match config.linguistic_mode {
            LinguisticMode::Word => linguistic::preprocess_linguistic_word(
                words,
                &config.phonemes,
                &config.languages,
                config.use_language_id,
                frame_width,
            )?,
            LinguisticMode::Phoneme => linguistic::preprocess_linguistic_phoneme(
                words,
                &config.phonemes,
                &config.languages,
                config.use_language_id,
                frame_width,
            )?,
        };
        {
            let mut inner = write_lock(&self.inner);
            let encoder = inner
                .encoder
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session(
                        "pitch linguistic encoder session is not initialized".to_string(),
                    )
                })?;
            linguistic::run_encoder(encoder.as_mut(), encoder_input, &mut predictor_input, false)?;
        }

        // Part 2: pitch predictor
        let mut note_rest = Vec::new();
        let mut note_midi = Vec::new();
        let mut note_dur = Vec::new();
        let mut duration_sum = 0.0;
        for word in words {
            for note in &word.notes {
                note_rest.push(note.is_rest);
                note_midi.push(if note.is_rest {
                    0.0f32
                } else {
                    note.key as f32 + note.cents as f32 / 100.0
                });
                let prev_frames = (duration_sum / frame_width).round() as i64;
                duration_sum += note.duration;
                let curr_frames = (duration_sum / frame_width).round() as i64;
                note_dur.push(curr_frames - prev_frames);
            }
        }
        let target_len: i64 = note_dur.iter().sum();
        let frames = target_len as usize;

        if !preprocess::fill_rest_midi_with_nearest(&mut note_midi, &note_rest) {
            return Err(DiffSingerError::Session("failed to fill rest notes".to_string()));
        }

        let note_count = note_midi.len() as i64;
        predictor_input.input("note_midi", Tensor::from_vec(vec![1, note_count], note_midi)?);
        if config.use_rest_flags {
            predictor_input.input("note_rest", Tensor::from_vec(vec![1, note_count], note_rest)?);
        }
        predictor_input.input("note_dur", Tensor::from_vec(vec![1, note_count], note_dur)?);

        let (ph_dur, _) = preprocess::phoneme_durations(words, frame_width)?;
        predictor_input.input("ph_dur", ph_dur);

        let mut satisfy_pitch = false;
        let mut satisfy_expr = !config.use_expressiveness;
        for param in input.parameters {
            let is_pitch = param.tag == ParamTag::Pitch;
            let is_expr = param.tag == ParamTag::Expr;
            if !is_pitch && !is_expr {
                continue;
            }
            let samples =
                preprocess::resample(&param.values, param.interval, frame_width, frames, true);
            if samples.len() != frames {
                return Err(DiffSingerError::Session(format!(
                    "parameter {} resample failed",
                    param.tag.name()
                )));
            }
            if is_pitch {
                let values: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
                predictor_input.input("pitch", Tensor::from_vec(vec![1, target_len], values)?);
                let mask = preprocess::retake_mask(param.retake.as_ref(), frame_width, target_len);
                predictor_input.input("retake", Tensor::from_vec(vec![1, target_len], mask)?);
                satisfy_pitch = true;
            } else if !satisfy_expr && is_expr {
                let values: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
                predictor_input.input("expr", Tensor::from_vec(vec![1, target_len], values)?);
                satisfy_expr = true;
            }
        }

        if !satisfy_pitch {
            // No pitch supplied: all-zero pitch, whole range marked retake.
            predictor_input.input("pitch", Tensor::filled(vec![1, target_len], 0.0f32)?);
            predictor_input.input("retake", Tensor::filled(vec![1, target_len], true)?);
        }
        if !satisfy_expr {
            // Model expects expr but none was supplied.
            predictor_input.input("expr", Tensor::filled(vec![1, target_len], 1.0f32)?);
        }

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return Err(DiffSingerError::Session(
                    "no speakers found in pitch input".to_string(),
                ));
            }
            predictor_input.input(
                "spk_embed",
                preprocess::speaker_embedding_frames(
                    input.speakers,
                    &config.speakers,
                    &self.spec.options.speaker_mapping,
                    config.hidden_size,
                    frame_width,
                    target_len,
                )?,
            );
        }

        let mut acceleration = input.steps;
        if !config.use_continuous_acceleration {
            acceleration = preprocess::speedup_from_steps(acceleration);
        }
        if config.use_continuous_acceleration {
            predictor_input.input("steps", Tensor::scalar(acceleration));
        } else {
            predictor_input.input("speedup", Tensor::scalar(acceleration));
        }

        predictor_input.output("pitch_pred");

        let session_result = {
            let mut inner = write_lock(&self.inner);
            let predictor = inner
                .predictor
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session(
                        "pitch predictor session is not initialized".to_string(),
                    )
                })?;
            predictor.run(&predictor_input)?
        };

        let Some(output) = session_result.outputs.get("pitch_pred") else {
            return Err(DiffSingerError::Session("invalid result output".to_string()));
        };
        let view = output
            .view::<f32>()
            .map_err(|_| DiffSingerError::Session("model output is not float".to_string()))?;
        if view.is_empty() {
            return Err(DiffSingerError::Session("model output is empty".to_string()));
        }

        let result = Arc::new(PitchResult {
            interval: frame_width,
            pitch: view.iter().map(|&v| v as f64).collect(),
        });
        write_lock(&self.inner).result = Some(result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::diffsinger::config::{ImportOptions, PitchConfig};
    use crate::engines::diffsinger::package::StageConfig;
    use crate::engines::diffsinger::score::{Note, Phone, Retake};
    use crate::engines::diffsinger::stages::testing::MockDriver;

    fn words() -> Vec<Word> {
        vec![Word {
            notes: vec![
                Note {
                    key: 0,
                    cents: 0,
                    duration: 0.1,
                    is_rest: true,
                },
                Note {
                    key: 69,
                    cents: 50,
                    duration: 0.4,
                    is_rest: false,
                },
            ],
            phones: vec![
                Phone {
                    token: "a".to_string(),
                    language: None,
                    start: 0.0,
                    speakers: Vec::new(),
                },
                Phone {
                    token: "k".to_string(),
                    language: None,
                    start: 0.25,
                    speakers: Vec::new(),
                },
            ],
        }]
    }

    fn spec(use_rest_flags: bool, use_expressiveness: bool) -> Arc<InferenceSpec> {
        let mut config = PitchConfig::default();
        for (i, token) in ["a", "k"].iter().enumerate() {
            config.phonemes.insert(token.to_string(), i as i64 + 1);
        }
        config.frame_width = 0.05;
        config.use_rest_flags = use_rest_flags;
        config.use_expressiveness = use_expressiveness;
        config.encoder = "linguistic.onnx".into();
        config.predictor = "pitch.onnx".into();
        Arc::new(InferenceSpec {
            kind: StageKind::Pitch,
            config: StageConfig::Pitch(config),
            schema: None,
            options: ImportOptions::default(),
        })
    }

    fn driver() -> Arc<MockDriver> {
        Arc::new(
            MockDriver::new()
                .with_output("encoder_out", Tensor::filled(vec![1, 2, 8], 0.25f32).unwrap())
                .with_output(
                    "pitch_pred",
                    Tensor::from_vec(vec![1, 10], vec![69.5f32; 10]).unwrap(),
                ),
        )
    }

    #[test]
    fn assembles_note_inputs_and_retake_mask() {
        let driver = driver();
        let stage = PitchInference::new(spec(true, false), driver.clone());
        stage.initialize(&TaskInitArgs::Pitch).unwrap();

        let words = words();
        let parameters = vec![Parameter {
            tag: ParamTag::Pitch,
            values: vec![69.0; 10],
            interval: 0.05,
            retake: Some(Retake {
                start: 0.1,
                end: 0.3,
            }),
        }];
        let result = stage
            .start(&PitchStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 50,
            })
            .unwrap();
        assert_eq!(result.interval, 0.05);
        assert_eq!(result.pitch.len(), 10);

        let run = driver.run_requesting("pitch_pred");
        // Rest note filled with the following pitch (69 + 50 cents).
        assert_eq!(
            run.inputs["note_midi"].view::<f32>().unwrap(),
            &[69.5, 69.5]
        );
        assert_eq!(run.inputs["note_rest"].view::<bool>().unwrap(), &[true, false]);
        assert_eq!(run.inputs["note_dur"].view::<i64>().unwrap(), &[2, 8]);
        // Retake window [0.1, 0.3) at 50ms frames is frames [2, 6).
        let retake = run.inputs["retake"].view::<bool>().unwrap();
        assert_eq!(retake.iter().filter(|&&m| m).count(), 4);
        assert!(retake[2] && retake[5] && !retake[1] && !retake[6]);
        // Legacy acceleration: 1000 / 50 steps = 20x speedup.
        assert_eq!(run.inputs["speedup"].view::<i64>().unwrap(), &[20]);
        assert!(!run.inputs.contains_key("steps"));
        assert!(!run.inputs.contains_key("expr"));
    }

    #[test]
    fn defaults_missing_pitch_and_expr() {
        let driver = driver();
        let stage = PitchInference::new(spec(false, true), driver.clone());
        stage.initialize(&TaskInitArgs::Pitch).unwrap();

        let words = words();
        stage
            .start(&PitchStartInput {
                words: &words,
                parameters: &[],
                speakers: &[],
                steps: 50,
            })
            .unwrap();

        let run = driver.run_requesting("pitch_pred");
        assert!(!run.inputs.contains_key("note_rest"));
        assert_eq!(run.inputs["pitch"].view::<f32>().unwrap(), &[0.0f32; 10]);
        assert_eq!(run.inputs["retake"].view::<bool>().unwrap(), &[true; 10]);
        assert_eq!(run.inputs["expr"].view::<f32>().unwrap(), &[1.0f32; 10]);
    }

    #[test]
    fn speaker_embedding_requires_speakers() {
        let driver = driver();
        let spec = {
            let mut config = PitchConfig::default();
            config.phonemes.insert("a".to_string(), 1);
            config.phonemes.insert("k".to_string(), 2);
            config.frame_width = 0.05;
            config.use_speaker_embedding = true;
            config.hidden_size = 4;
            config.encoder = "linguistic.onnx".into();
            config.predictor = "pitch.onnx".into();
            Arc::new(InferenceSpec {
                kind: StageKind::Pitch,
                config: StageConfig::Pitch(config),
                schema: None,
                options: ImportOptions::default(),
            })
        };
        let stage = PitchInference::new(spec, driver);
        stage.initialize(&TaskInitArgs::Pitch).unwrap();
        let words = words();
        let err = stage
            .start(&PitchStartInput {
                words: &words,
                parameters: &[],
                speakers: &[],
                steps: 50,
            })
            .unwrap_err();
        assert!(err.to_string().contains("no speakers found in pitch input"));
        assert_eq!(stage.state(), TaskState::Failed);
    }
}
