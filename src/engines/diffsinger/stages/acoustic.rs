//! Acoustic stage: turns the fully-annotated score into a mel spectrogram.
//!
//! Inputs are gated by the configuration's declared parameter set. The F0
//! curve is resolved from the score (verbatim F0, or MIDI pitch converted to
//! Hz, with an optional tone shift applied) and the resulting tensor is both
//! fed to the acoustic model and retained for the vocoder.

use std::sync::{Arc, RwLock};

use crate::engines::diffsinger::driver::{
    InferenceDriver, InferenceSession, SessionOpenArgs, SessionRunInput,
};
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::package::InferenceSpec;
use crate::engines::diffsinger::preprocess;
use crate::engines::diffsinger::score::{ParamTag, Parameter, SpeakerCurve, Word};
use crate::engines::diffsinger::tensor::Tensor;

use super::{check_init_args, read_lock, write_lock, StageKind, StateCell, TaskInitArgs, TaskState};

pub struct AcousticStartInput<'a> {
    pub words: &'a [Word],
    pub parameters: &'a [Parameter],
    pub speakers: &'a [SpeakerCurve],
    pub steps: i64,
    pub depth: f64,
}

#[derive(Debug, Clone)]
pub struct AcousticResult {
    pub mel: Arc<Tensor>,
    /// The F0 tensor fed to the acoustic model, shared with the vocoder.
    pub f0: Arc<Tensor>,
}

struct Inner {
    session: Option<Box<dyn InferenceSession>>,
    result: Option<Arc<AcousticResult>>,
}

pub struct AcousticInference {
    spec: Arc<InferenceSpec>,
    driver: Arc<dyn InferenceDriver>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl AcousticInference {
    pub fn new(spec: Arc<InferenceSpec>, driver: Arc<dyn InferenceDriver>) -> AcousticInference {
        AcousticInference {
            spec,
            driver,
            state: StateCell::new(),
            inner: RwLock::new(Inner {
                session: None,
                result: None,
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn result(&self) -> Option<Arc<AcousticResult>> {
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
        check_init_args(StageKind::Acoustic, args)?;
        let config = self.spec.acoustic_config()?;

        let mut inner = write_lock(&self.inner);
        inner.result = None;

        let mut session = self.driver.create_session();
        session.open(&config.model, &SessionOpenArgs::default())?;
        inner.session = Some(session);
        drop(inner);

        self.state.set(TaskState::Idle);
        Ok(())
    }

    pub fn start(&self, input: &AcousticStartInput<'_>) -> Result<Arc<AcousticResult>> {
        {
            let inner = read_lock(&self.inner);
            if inner.session.is_none() {
                self.state.set(TaskState::Failed);
                return Err(DiffSingerError::Session(
                    "acoustic inference is not initialized".to_string(),
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

    pub fn start_async(&self, _input: &AcousticStartInput<'_>) -> Result<()> {
        Err(DiffSingerError::NotImplemented("asynchronous stage start"))
    }

    pub fn stop(&self) -> bool {
        let inner = read_lock(&self.inner);
        let accepted = match &inner.session {
            Some(session) if session.is_open() => session.stop(),
            _ => false,
        };
        drop(inner);
        if accepted {
            self.state.set(TaskState::Terminated);
        }
        accepted
    }

    fn run(&self, input: &AcousticStartInput<'_>) -> Result<Arc<AcousticResult>> {
        let config = self.spec.acoustic_config()?;
        let words = input.words;
        let frame_width = config.frame_width();

        let mut session_input = SessionRunInput::new();

        session_input.input(
            "tokens",
            preprocess::phoneme_tokens(words, &config.phonemes)?,
        );
        if config.use_language_id {
            session_input.input(
                "languages",
                preprocess::phoneme_languages(words, &config.languages)?,
            );
        }
        let (durations, target_len) = preprocess::phoneme_durations(words, frame_width)?;
        session_input.input("durations", durations);
        let frames = target_len as usize;

        let mut acceleration = input.steps;
        if !config.use_continuous_acceleration {
            acceleration = preprocess::speedup_from_steps(acceleration);
        }
        if config.use_continuous_acceleration {
            session_input.input("steps", Tensor::scalar(acceleration));
        } else {
            session_input.input("speedup", Tensor::scalar(acceleration));
        }

        if config.use_variable_depth {
            session_input.input("depth", Tensor::scalar(input.depth as f32));
        } else {
            let mut depth = (input.depth * 1000.0).round() as i64;
            depth = depth.clamp(0, config.max_depth);
            // Keep depth divisible by the acceleration. A continuous model
            // receives the raw step count, which the score may legally set
            // to zero or below; saturate so the quantization cannot trap.
            let quantum = acceleration.max(1);
            depth = depth / quantum * quantum;
            session_input.input("depth", Tensor::scalar(depth));
        }

        // A parameter is required when the configuration declares it; a
        // declared parameter supplied by the user satisfies it.
        let declared = |tag: ParamTag| config.parameters.contains(&tag);
        let mut satisfy_gender = !declared(ParamTag::Gender);
        let mut satisfy_velocity = !declared(ParamTag::Velocity);
        let mut satisfy_energy = !declared(ParamTag::Energy);
        let mut satisfy_breathiness = !declared(ParamTag::Breathiness);
        let mut satisfy_voicing = !declared(ParamTag::Voicing);
        let mut satisfy_tension = !declared(ParamTag::Tension);
        let mut satisfy_mouth_opening = !declared(ParamTag::MouthOpening);

        let mut f0_param: Option<&Parameter> = None;
        let mut pitch_param: Option<&Parameter> = None;
        let mut tone_shift_param: Option<&Parameter> = None;

        for param in input.parameters {
            match param.tag {
                ParamTag::F0 => {
                    f0_param = Some(param);
                    continue;
                }
                ParamTag::Pitch => {
                    pitch_param = Some(param);
                    continue;
                }
                ParamTag::ToneShift => {
                    tone_shift_param = Some(param);
                    continue;
                }
                _ => {}
            }

            let samples =
                preprocess::resample(&param.values, param.interval, frame_width, frames, true);
            if samples.is_empty() {
                // An empty transition curve falls back to its neutral value.
                if param.tag == ParamTag::Gender {
                    session_input.input("gender", Tensor::filled(vec![1, target_len], 0.0f32)?);
                    satisfy_gender = true;
                    continue;
                }
                if param.tag == ParamTag::Velocity {
                    session_input.input("velocity", Tensor::filled(vec![1, target_len], 1.0f32)?);
                    satisfy_velocity = true;
                    continue;
                }
            }
            if samples.len() != frames {
                return Err(DiffSingerError::Session(format!(
                    "parameter {} resample failed",
                    param.tag.name()
                )));
            }

            let satisfied = match param.tag {
                ParamTag::Gender => &mut satisfy_gender,
                ParamTag::Velocity => &mut satisfy_velocity,
                ParamTag::Energy => &mut satisfy_energy,
                ParamTag::Breathiness => &mut satisfy_breathiness,
                ParamTag::Voicing => &mut satisfy_voicing,
                ParamTag::Tension => &mut satisfy_tension,
                ParamTag::MouthOpening => &mut satisfy_mouth_opening,
                _ => continue,
            };
            if *satisfied {
                // Either undeclared or already filled in; drop the curve.
                continue;
            }
            let values: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
            session_input.input(
                param.tag.name(),
                Tensor::from_vec(vec![1, target_len], values)?,
            );
            *satisfied = true;
        }

        // Declared transition parameters missing from the input get their
        // neutral defaults.
        if !satisfy_gender {
            session_input.input("gender", Tensor::filled(vec![1, target_len], 0.0f32)?);
        }
        if !satisfy_velocity {
            session_input.input("velocity", Tensor::filled(vec![1, target_len], 1.0f32)?);
        }

        // F0 first; fall back to MIDI pitch converted to Hz.
        let f0_tensor = if let Some(param) = f0_param {
            self.build_f0(param, tone_shift_param, false, frame_width, frames, target_len)?
        } else if let Some(param) = pitch_param {
            self.build_f0(param, tone_shift_param, true, frame_width, frames, target_len)?
        } else {
            return Err(DiffSingerError::Session(
                "parameter f0 or pitch missing".to_string(),
            ));
        };
        session_input.input_shared("f0", f0_tensor.clone());

        if !satisfy_energy || !satisfy_breathiness || !satisfy_voicing || !satisfy_tension {
            let mut message = String::from("some required parameters missing:");
            if !satisfy_energy {
                message.push_str(" \"energy\"");
            }
            if !satisfy_breathiness {
                message.push_str(" \"breathiness\"");
            }
            if !satisfy_voicing {
                message.push_str(" \"voicing\"");
            }
            if !satisfy_tension {
                message.push_str(" \"tension\"");
            }
            return Err(DiffSingerError::Session(message));
        }

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return Err(DiffSingerError::Session(
                    "no speakers found in acoustic input".to_string(),
                ));
            }
            session_input.input(
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

        session_input.output("mel");

        let session_result = {
            let mut inner = write_lock(&self.inner);
            let session = inner
                .session
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session("acoustic session is not initialized".to_string())
                })?;
            session.run(&session_input)?
        };

        let Some(mel) = session_result.outputs.get("mel") else {
            return Err(DiffSingerError::Session("invalid result output".to_string()));
        };

        let result = Arc::new(AcousticResult {
            mel: mel.clone(),
            f0: f0_tensor,
        });
        write_lock(&self.inner).result = Some(result.clone());
        Ok(result)
    }

    /// Resample the pitch/F0 curve, apply the tone shift and convert to Hz.
    fn build_f0(
        &self,
        param: &Parameter,
        tone_shift: Option<&Parameter>,
        convert_midi: bool,
        frame_width: f64,
        frames: usize,
        target_len: i64,
    ) -> Result<Arc<Tensor>> {
        let mut samples =
            preprocess::resample(&param.values, param.interval, frame_width, frames, true);
        if samples.len() != frames {
            return Err(DiffSingerError::Session(format!(
                "parameter {} resample failed",
                param.tag.name()
            )));
        }

        if let Some(tone_shift) = tone_shift {
            if !tone_shift.values.is_empty() {
                let shift = preprocess::resample(
                    &tone_shift.values,
                    tone_shift.interval,
                    frame_width,
                    frames,
                    false,
                );
                if shift.len() != frames {
                    return Err(DiffSingerError::Session(format!(
                        "parameter {} resample failed",
                        tone_shift.tag.name()
                    )));
                }
                if convert_midi {
                    // Shift in MIDI space: one semitone per 100 cents.
                    for (sample, cents) in samples.iter_mut().zip(&shift) {
                        *sample += cents / 100.0;
                    }
                } else {
                    // Shift in Hz space: scale by 2^(cents/1200).
                    for (sample, cents) in samples.iter_mut().zip(&shift) {
                        *sample *= (cents / 1200.0).exp2();
                    }
                }
            }
        }

        let values: Vec<f32> = if convert_midi {
            samples
                .iter()
                .map(|&midi| preprocess::midi_to_hz(midi) as f32)
                .collect()
        } else {
            samples.iter().map(|&hz| hz as f32).collect()
        };
        Ok(Arc::new(Tensor::from_vec(vec![1, target_len], values)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::diffsinger::config::{AcousticConfig, ImportOptions};
    use crate::engines::diffsinger::package::StageConfig;
    use crate::engines::diffsinger::score::{Note, Phone};
    use crate::engines::diffsinger::stages::testing::MockDriver;

    fn words(duration: f64) -> Vec<Word> {
        vec![Word {
            notes: vec![Note {
                key: 69,
                cents: 0,
                duration,
                is_rest: false,
            }],
            phones: vec![Phone {
                token: "a".to_string(),
                language: None,
                start: 0.0,
                speakers: Vec::new(),
            }],
        }]
    }

    fn spec(configure: impl FnOnce(&mut AcousticConfig)) -> Arc<InferenceSpec> {
        let mut config = AcousticConfig::default();
        config.phonemes.insert("a".to_string(), 1);
        config.sample_rate = 100;
        config.hop_size = 5; // 50 ms frames
        config.model = "acoustic.onnx".into();
        configure(&mut config);
        Arc::new(InferenceSpec {
            kind: StageKind::Acoustic,
            config: StageConfig::Acoustic(config),
            schema: None,
            options: ImportOptions::default(),
        })
    }

    fn driver() -> Arc<MockDriver> {
        Arc::new(MockDriver::new().with_output(
            "mel",
            Tensor::filled(vec![1, 10, 16], 0.5f32).unwrap(),
        ))
    }

    fn f0_param(values: Vec<f64>) -> Parameter {
        Parameter {
            tag: ParamTag::F0,
            values,
            interval: 0.05,
            retake: None,
        }
    }

    #[test]
    fn depth_is_clamped_and_quantized() {
        // steps=100 -> speedup 10; depth 0.173 -> 173 -> quantized down to 170
        let driver = driver();
        let stage = AcousticInference::new(
            spec(|c| {
                c.max_depth = 1000;
            }),
            driver.clone(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![f0_param(vec![440.0; 10])];
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.173,
            })
            .unwrap();
        let run = driver.run_requesting("mel");
        assert_eq!(run.inputs["speedup"].view::<i64>().unwrap(), &[10]);
        assert_eq!(run.inputs["depth"].view::<i64>().unwrap(), &[170]);

        // With a lower ceiling the clamp engages before quantization.
        let driver2 = self::driver();
        let stage = AcousticInference::new(
            spec(|c| {
                c.max_depth = 150;
            }),
            driver2.clone(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.173,
            })
            .unwrap();
        let run = driver2.run_requesting("mel");
        assert_eq!(run.inputs["depth"].view::<i64>().unwrap(), &[150]);
    }

    #[test]
    fn zero_steps_do_not_trap_depth_quantization() {
        // Continuous acceleration forwards the raw step count, so the depth
        // quantum must saturate when the score says steps = 0.
        let driver = driver();
        let stage = AcousticInference::new(
            spec(|c| {
                c.use_continuous_acceleration = true;
                c.max_depth = 1000;
            }),
            driver.clone(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![f0_param(vec![440.0; 10])];
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 0,
                depth: 0.173,
            })
            .unwrap();
        let run = driver.run_requesting("mel");
        assert_eq!(run.inputs["steps"].view::<i64>().unwrap(), &[0]);
        assert_eq!(run.inputs["depth"].view::<i64>().unwrap(), &[173]);
    }

    #[test]
    fn variable_depth_passes_float() {
        let driver = driver();
        let stage = AcousticInference::new(
            spec(|c| {
                c.use_variable_depth = true;
                c.use_continuous_acceleration = true;
            }),
            driver.clone(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![f0_param(vec![440.0; 10])];
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 40,
                depth: 0.6,
            })
            .unwrap();
        let run = driver.run_requesting("mel");
        assert_eq!(run.inputs["steps"].view::<i64>().unwrap(), &[40]);
        assert!((run.inputs["depth"].view::<f32>().unwrap()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn tone_shift_scales_hz_f0() {
        let driver = driver();
        let stage = AcousticInference::new(spec(|_| {}), driver.clone());
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.1); // 2 frames
        let parameters = vec![
            f0_param(vec![440.0, 440.0]),
            Parameter {
                tag: ParamTag::ToneShift,
                values: vec![0.0, 1200.0],
                interval: 0.05,
                retake: None,
            },
        ];
        let result = stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap();
        let f0 = result.f0.view::<f32>().unwrap();
        assert!((f0[0] - 440.0).abs() < 1e-3);
        assert!((f0[1] - 880.0).abs() < 1e-3);

        // The same tensor is wired into the model input.
        let run = driver.run_requesting("mel");
        assert!(Arc::ptr_eq(&run.inputs["f0"], &result.f0));
    }

    #[test]
    fn midi_pitch_converts_to_hz() {
        let driver = driver();
        let stage = AcousticInference::new(spec(|_| {}), driver.clone());
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.1);
        let parameters = vec![Parameter {
            tag: ParamTag::Pitch,
            values: vec![69.0, 57.0],
            interval: 0.05,
            retake: None,
        }];
        let result = stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap();
        let f0 = result.f0.view::<f32>().unwrap();
        assert!((f0[0] - 440.0).abs() < 1e-3);
        assert!((f0[1] - 220.0).abs() < 1e-3);
    }

    #[test]
    fn missing_f0_and_pitch_is_fatal() {
        let stage = AcousticInference::new(spec(|_| {}), driver());
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let err = stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &[],
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap_err();
        assert!(err.to_string().contains("parameter f0 or pitch missing"));
    }

    #[test]
    fn missing_declared_variances_are_enumerated() {
        let stage = AcousticInference::new(
            spec(|c| {
                c.parameters.insert(ParamTag::Energy);
                c.parameters.insert(ParamTag::Voicing);
            }),
            driver(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![f0_param(vec![440.0; 10])];
        let err = stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("some required parameters missing"));
        assert!(message.contains("\"energy\""));
        assert!(message.contains("\"voicing\""));
        assert!(!message.contains("\"tension\""));
        assert_eq!(stage.state(), TaskState::Failed);
    }

    #[test]
    fn declared_transitions_default_when_absent() {
        let driver = driver();
        let stage = AcousticInference::new(
            spec(|c| {
                c.parameters.insert(ParamTag::Gender);
                c.parameters.insert(ParamTag::Velocity);
            }),
            driver.clone(),
        );
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![f0_param(vec![440.0; 10])];
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap();
        let run = driver.run_requesting("mel");
        assert_eq!(run.inputs["gender"].view::<f32>().unwrap(), &[0.0f32; 10]);
        assert_eq!(run.inputs["velocity"].view::<f32>().unwrap(), &[1.0f32; 10]);
    }

    #[test]
    fn undeclared_parameter_curves_are_dropped() {
        let driver = driver();
        let stage = AcousticInference::new(spec(|_| {}), driver.clone());
        stage.initialize(&TaskInitArgs::Acoustic).unwrap();
        let words = words(0.5);
        let parameters = vec![
            f0_param(vec![440.0; 10]),
            Parameter {
                tag: ParamTag::Energy,
                values: vec![0.5; 10],
                interval: 0.05,
                retake: None,
            },
        ];
        stage
            .start(&AcousticStartInput {
                words: &words,
                parameters: &parameters,
                speakers: &[],
                steps: 100,
                depth: 0.0,
            })
            .unwrap();
        let run = driver.run_requesting("mel");
        assert!(!run.inputs.contains_key("energy"));
    }
}
