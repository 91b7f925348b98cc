//! Variance stage: predicts the per-frame variance parameters the packaged
//! schema declares (energy, breathiness, voicing, tension, mouth opening).
//!
//! Every declared parameter gets one input curve (user-supplied or zeros)
//! and one column in the 3-D retake mask, and must come back from the
//! predictor as `<name>_pred`.

use std::sync::{Arc, RwLock};

use crate::engines::diffsinger::config::LinguisticMode;
use crate::engines::diffsinger::driver::{
    InferenceDriver, InferenceSession, SessionOpenArgs, SessionRunInput,
};
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::linguistic;
use crate::engines::diffsinger::package::InferenceSpec;
use crate::engines::diffsinger::preprocess;
use crate::engines::diffsinger::score::{total_duration, ParamTag, Parameter, SpeakerCurve, Word};
use crate::engines::diffsinger::tensor::Tensor;

use super::{check_init_args, read_lock, write_lock, StageKind, StateCell, TaskInitArgs, TaskState};

pub struct VarianceStartInput<'a> {
    pub words: &'a [Word],
    pub parameters: &'a [Parameter],
    pub speakers: &'a [SpeakerCurve],
    pub steps: i64,
}

#[derive(Debug, Clone)]
pub struct VarianceResult {
    /// One predicted parameter per schema entry, at the stage's frame width.
    pub predictions: Vec<Parameter>,
}

struct Inner {
    encoder: Option<Box<dyn InferenceSession>>,
    predictor: Option<Box<dyn InferenceSession>>,
    result: Option<Arc<VarianceResult>>,
}

pub struct VarianceInference {
    spec: Arc<InferenceSpec>,
    driver: Arc<dyn InferenceDriver>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl VarianceInference {
    pub fn new(spec: Arc<InferenceSpec>, driver: Arc<dyn InferenceDriver>) -> VarianceInference {
        VarianceInference {
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

    pub fn result(&self) -> Option<Arc<VarianceResult>> {
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
        check_init_args(StageKind::Variance, args)?;
        let config = self.spec.variance_config()?;

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

    pub fn start(&self, input: &VarianceStartInput<'_>) -> Result<Arc<VarianceResult>> {
        {
            let inner = read_lock(&self.inner);
            if inner.encoder.is_none() || inner.predictor.is_none() {
                self.state.set(TaskState::Failed);
                return Err(DiffSingerError::Session(
                    "variance inference is not initialized".to_string(),
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

    pub fn start_async(&self, _input: &VarianceStartInput<'_>) -> Result<()> {
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

    fn run(&self, input: &VarianceStartInput<'_>) -> Result<Arc<VarianceResult>> {
        let config = self.spec.variance_config()?;
        let schema = self.spec.variance_schema()?;
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
                        "variance linguistic encoder session is not initialized".to_string(),
                    )
                })?;
            linguistic::run_encoder(encoder.as_mut(), encoder_input, &mut predictor_input, false)?;
        }

        // Part 2: variance predictor
        let target_len = (total_duration(words) / frame_width).round() as i64;
        let frames = target_len as usize;

        let (ph_dur, _) = preprocess::phoneme_durations(words, frame_width)?;
        predictor_input.input("ph_dur", ph_dur);

        if schema.predictions.is_empty() {
            return Err(DiffSingerError::Session(
                "no parameters to predict".to_string(),
            ));
        }
        let prediction_count = schema.predictions.len();

        let mut satisfy_pitch = false;
        let mut satisfied = vec![false; prediction_count];
        // One retake column per predicted parameter, [1, frames, predictions].
        let mut retake = vec![true; frames * prediction_count];

        for param in input.parameters {
            let samples =
                preprocess::resample(&param.values, param.interval, frame_width, frames, true);
            if samples.len() != frames {
                return Err(DiffSingerError::Session(format!(
                    "parameter {} resample failed",
                    param.tag.name()
                )));
            }

            if param.tag == ParamTag::Pitch {
                let values: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
                predictor_input.input("pitch", Tensor::from_vec(vec![1, target_len], values)?);
                satisfy_pitch = true;
                continue;
            }

            for (column, prediction) in schema.predictions.iter().enumerate() {
                if param.tag != *prediction {
                    continue;
                }
                let values: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
                predictor_input.input(
                    param.tag.name(),
                    Tensor::from_vec(vec![1, target_len], values)?,
                );
                predictor_input.output(format!("{}_pred", param.tag.name()));
                fill_retake_column(
                    &mut retake,
                    frames,
                    prediction_count,
                    column,
                    param,
                    frame_width,
                    target_len,
                );
                satisfied[column] = true;
            }
        }

        predictor_input.input(
            "retake",
            Tensor::from_vec(
                vec![1, target_len, prediction_count as i64],
                retake,
            )?,
        );

        if !satisfy_pitch {
            return Err(DiffSingerError::Session("missing pitch input".to_string()));
        }

        for (column, prediction) in schema.predictions.iter().enumerate() {
            if satisfied[column] {
                continue;
            }
            // Parameters the user did not supply are zero-filled.
            predictor_input.input(
                prediction.name(),
                Tensor::filled(vec![1, target_len], 0.0f32)?,
            );
            predictor_input.output(format!("{}_pred", prediction.name()));
        }

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return Err(DiffSingerError::Session(
                    "no speakers found in variance input".to_string(),
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

        let session_result = {
            let mut inner = write_lock(&self.inner);
            let predictor = inner
                .predictor
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session(
                        "variance predictor session is not initialized".to_string(),
                    )
                })?;
            predictor.run(&predictor_input)?
        };

        let mut predictions = Vec::with_capacity(prediction_count);
        for prediction in &schema.predictions {
            let output_name = format!("{}_pred", prediction.name());
            let Some(output) = session_result.outputs.get(&output_name) else {
                continue;
            };
            let view = output
                .view::<f32>()
                .map_err(|_| DiffSingerError::Session("model output is not float".to_string()))?;
            predictions.push(Parameter {
                tag: *prediction,
                values: view.iter().map(|&v| v as f64).collect(),
                interval: frame_width,
                retake: None,
            });
        }

        if predictions.len() != prediction_count {
            return Err(DiffSingerError::Session(format!(
                "predicted parameter count mismatch: expected {}, got {}",
                prediction_count,
                predictions.len()
            )));
        }

        let result = Arc::new(VarianceResult { predictions });
        write_lock(&self.inner).result = Some(result.clone());
        Ok(result)
    }
}

/// Overwrite one parameter's column of the `[1, frames, predictions]` retake
/// mask from its retake window.
fn fill_retake_column(
    retake: &mut [bool],
    frames: usize,
    prediction_count: usize,
    column: usize,
    param: &Parameter,
    frame_width: f64,
    target_len: i64,
) {
    let Some(window) = &param.retake else {
        // No retake window: the whole column stays true.
        return;
    };
    let start = preprocess::retake_frame(window.start, frame_width, target_len, 0) as usize;
    let end = preprocess::retake_frame(window.end, frame_width, target_len, target_len) as usize;
    for frame in 0..frames {
        let keep = if start == end {
            false
        } else {
            frame >= start && frame < end
        };
        retake[frame * prediction_count + column] = keep;
    }
}
