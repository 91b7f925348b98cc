//! Pipeline orchestration: drives the five stages in order and merges each
//! stage's output back into the score.
//!
//! The orchestrator is the only mutator of the score. Stages return plain
//! result structs; the small merge functions below apply them, so each
//! stage's effect on the document is explicit and testable.

use std::sync::Arc;

use crate::engines::diffsinger::config::{AcousticConfig, VocoderConfig};
use crate::engines::diffsinger::driver::InferenceDriver;
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::package::{InferenceSpec, SingerSpec};
use crate::engines::diffsinger::score::{ParamTag, Parameter, ScoreDocument, Word};
use crate::engines::diffsinger::stages::{
    AcousticInference, AcousticStartInput, DurationInference, DurationStartInput, PitchInference,
    PitchResult, PitchStartInput, StageKind, TaskInitArgs, VarianceInference, VarianceStartInput,
    VocoderInference, VocoderStartInput,
};

/// Rendered audio with the sample rate the configs agreed on.
#[derive(Debug)]
pub struct RenderOutput {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Render one score with one singer. Mutates the score in place: phoneme
/// start times after the duration stage, pitch and variance parameters after
/// their stages.
pub fn run_pipeline(
    singer: &SingerSpec,
    driver: Arc<dyn InferenceDriver>,
    score: &mut ScoreDocument,
) -> Result<RenderOutput> {
    let import = |kind: StageKind| -> Result<Arc<InferenceSpec>> {
        singer.import(kind).cloned().ok_or_else(|| {
            DiffSingerError::InvalidArgument(format!(
                "{} inference not found for singer \"{}\"",
                kind.api_name(),
                singer.id
            ))
        })
    };
    let duration_spec = import(StageKind::Duration)?;
    let pitch_spec = import(StageKind::Pitch)?;
    let variance_spec = import(StageKind::Variance)?;
    let acoustic_spec = import(StageKind::Acoustic)?;
    let vocoder_spec = import(StageKind::Vocoder)?;

    let acoustic_config = acoustic_spec.acoustic_config()?;
    let vocoder_config = vocoder_spec.vocoder_config()?;
    check_acoustic_vocoder(acoustic_config, vocoder_config)?;
    let sample_rate = acoustic_config.sample_rate as u32;

    // Duration
    {
        log::debug!("singer \"{}\": running duration stage", singer.id);
        let stage = DurationInference::new(duration_spec, driver.clone());
        stage
            .initialize(&TaskInitArgs::Duration)
            .map_err(|e| stage_error("initialize", StageKind::Duration, &singer.id, e))?;
        let result = stage
            .start(&DurationStartInput {
                words: &score.words,
            })
            .map_err(|e| stage_error("run", StageKind::Duration, &singer.id, e))?;
        apply_durations(&mut score.words, &result.durations);
    }

    // Pitch
    {
        log::debug!("singer \"{}\": running pitch stage", singer.id);
        let stage = PitchInference::new(pitch_spec, driver.clone());
        stage
            .initialize(&TaskInitArgs::Pitch)
            .map_err(|e| stage_error("initialize", StageKind::Pitch, &singer.id, e))?;
        let parameters: Vec<Parameter> = score
            .parameters
            .iter()
            .filter(|p| matches!(p.tag, ParamTag::Pitch | ParamTag::Expr))
            .cloned()
            .collect();
        let result = stage
            .start(&PitchStartInput {
                words: &score.words,
                parameters: &parameters,
                speakers: &score.speakers,
                steps: score.steps,
            })
            .map_err(|e| stage_error("run", StageKind::Pitch, &singer.id, e))?;
        merge_pitch(&mut score.parameters, &result);
    }

    // Variance
    {
        log::debug!("singer \"{}\": running variance stage", singer.id);
        let schema = variance_spec.variance_schema()?.clone();
        let stage = VarianceInference::new(variance_spec, driver.clone());
        stage
            .initialize(&TaskInitArgs::Variance)
            .map_err(|e| stage_error("initialize", StageKind::Variance, &singer.id, e))?;
        let parameters: Vec<Parameter> = score
            .parameters
            .iter()
            .filter(|p| p.tag == ParamTag::Pitch || schema.predictions.contains(&p.tag))
            .cloned()
            .collect();
        let result = stage
            .start(&VarianceStartInput {
                words: &score.words,
                parameters: &parameters,
                speakers: &score.speakers,
                steps: score.steps,
            })
            .map_err(|e| stage_error("run", StageKind::Variance, &singer.id, e))?;
        merge_variances(&mut score.parameters, result.predictions.clone());
    }

    // Acoustic
    let acoustic_result = {
        log::debug!("singer \"{}\": running acoustic stage", singer.id);
        let stage = AcousticInference::new(acoustic_spec, driver.clone());
        stage
            .initialize(&TaskInitArgs::Acoustic)
            .map_err(|e| stage_error("initialize", StageKind::Acoustic, &singer.id, e))?;
        stage
            .start(&AcousticStartInput {
                words: &score.words,
                parameters: &score.parameters,
                speakers: &score.speakers,
                steps: score.steps,
                depth: score.depth,
            })
            .map_err(|e| stage_error("run", StageKind::Acoustic, &singer.id, e))?
    };

    // Vocoder
    let vocoder_result = {
        log::debug!("singer \"{}\": running vocoder stage", singer.id);
        let stage = VocoderInference::new(vocoder_spec, driver);
        stage
            .initialize(&TaskInitArgs::Vocoder)
            .map_err(|e| stage_error("initialize", StageKind::Vocoder, &singer.id, e))?;
        stage
            .start(&VocoderStartInput {
                mel: acoustic_result.mel.clone(),
                f0: acoustic_result.f0.clone(),
            })
            .map_err(|e| stage_error("run", StageKind::Vocoder, &singer.id, e))?
    };

    log::info!(
        "singer \"{}\": rendered {} samples at {} Hz",
        singer.id,
        vocoder_result.samples.len(),
        sample_rate
    );
    Ok(RenderOutput {
        samples: vocoder_result.samples.clone(),
        sample_rate,
    })
}

fn stage_error(
    action: &str,
    kind: StageKind,
    singer_id: &str,
    error: DiffSingerError,
) -> DiffSingerError {
    DiffSingerError::Session(format!(
        "failed to {} {} inference for singer \"{}\": {}",
        action,
        kind.api_name(),
        singer_id,
        error
    ))
}

/// Refuse to run when the acoustic and vocoder models disagree on the mel
/// contract. All differing fields are reported in one error.
pub fn check_acoustic_vocoder(
    acoustic: &AcousticConfig,
    vocoder: &VocoderConfig,
) -> Result<()> {
    let mut mismatched = Vec::new();
    if acoustic.sample_rate != vocoder.sample_rate {
        mismatched.push("sampleRate");
    }
    if acoustic.hop_size != vocoder.hop_size {
        mismatched.push("hopSize");
    }
    if acoustic.win_size != vocoder.win_size {
        mismatched.push("winSize");
    }
    if acoustic.fft_size != vocoder.fft_size {
        mismatched.push("fftSize");
    }
    if acoustic.mel_channels != vocoder.mel_channels {
        mismatched.push("melChannels");
    }
    if acoustic.mel_min_freq != vocoder.mel_min_freq {
        mismatched.push("melMinFreq");
    }
    if acoustic.mel_max_freq != vocoder.mel_max_freq {
        mismatched.push("melMaxFreq");
    }
    if acoustic.mel_base != vocoder.mel_base {
        mismatched.push("melBase");
    }
    if acoustic.mel_scale != vocoder.mel_scale {
        mismatched.push("melScale");
    }
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(DiffSingerError::InvalidArgument(format!(
            "acoustic and vocoder config mismatch: {}",
            mismatched.join(", ")
        )))
    }
}

/// Fill phoneme start times cumulatively within each word from the predicted
/// durations.
pub fn apply_durations(words: &mut [Word], durations: &[f64]) {
    let mut index = 0;
    for word in words {
        let mut cursor = 0.0;
        for phone in &mut word.phones {
            if index >= durations.len() {
                return;
            }
            phone.start = cursor;
            cursor += durations[index];
            index += 1;
        }
    }
}

/// Replace the score's pitch parameter with the predicted curve, or append
/// one when the user supplied none.
pub fn merge_pitch(parameters: &mut Vec<Parameter>, result: &PitchResult) {
    let mut replaced = false;
    for param in parameters.iter_mut() {
        if param.tag == ParamTag::Pitch {
            param.values = result.pitch.clone();
            param.interval = result.interval;
            replaced = true;
        }
    }
    if !replaced {
        parameters.push(Parameter {
            tag: ParamTag::Pitch,
            values: result.pitch.clone(),
            interval: result.interval,
            retake: None,
        });
    }
}

/// Replace user parameters whose tag was predicted (clearing their retake
/// windows) and append predictions for tags the user never supplied.
pub fn merge_variances(parameters: &mut Vec<Parameter>, predictions: Vec<Parameter>) {
    for predicted in predictions {
        match parameters.iter_mut().find(|p| p.tag == predicted.tag) {
            Some(existing) => {
                existing.values = predicted.values;
                existing.interval = predicted.interval;
                existing.retake = None;
            }
            None => parameters.push(predicted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::diffsinger::config::{
        DurationConfig, ImportOptions, PitchConfig, VarianceConfig, VarianceSchema,
    };
    use crate::engines::diffsinger::package::StageConfig;
    use crate::engines::diffsinger::score::{Note, Phone, Retake};
    use crate::engines::diffsinger::stages::testing::MockDriver;
    use crate::engines::diffsinger::tensor::Tensor;

    #[test]
    fn cross_check_lists_every_mismatch() {
        let acoustic = AcousticConfig {
            sample_rate: 44100,
            mel_channels: 128,
            mel_base: crate::engines::diffsinger::config::MelBase::E,
            ..AcousticConfig::default()
        };
        let vocoder = VocoderConfig {
            sample_rate: 48000,
            mel_channels: 80,
            mel_base: crate::engines::diffsinger::config::MelBase::Ten,
            ..VocoderConfig::default()
        };
        let err = check_acoustic_vocoder(&acoustic, &vocoder).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sampleRate"));
        assert!(message.contains("melChannels"));
        assert!(message.contains("melBase"));
        assert!(!message.contains("hopSize"));
        assert!(!message.contains("melScale"));

        let matching = VocoderConfig::default();
        let acoustic = AcousticConfig::default();
        assert!(check_acoustic_vocoder(&acoustic, &matching).is_ok());
    }

    #[test]
    fn durations_fill_starts_per_word() {
        let phone = |token: &str| Phone {
            token: token.to_string(),
            language: None,
            start: 0.0,
            speakers: Vec::new(),
        };
        let note = Note {
            key: 60,
            cents: 0,
            duration: 1.0,
            is_rest: false,
        };
        let mut words = vec![
            Word {
                notes: vec![note.clone()],
                phones: vec![phone("k"), phone("a")],
            },
            Word {
                notes: vec![note],
                phones: vec![phone("i")],
            },
        ];
        apply_durations(&mut words, &[0.4, 0.6, 1.0]);
        assert_eq!(words[0].phones[0].start, 0.0);
        assert!((words[0].phones[1].start - 0.4).abs() < 1e-12);
        // The cursor restarts inside each word.
        assert_eq!(words[1].phones[0].start, 0.0);
    }

    #[test]
    fn pitch_merge_replaces_without_duplicating() {
        let mut parameters = vec![Parameter {
            tag: ParamTag::Pitch,
            values: vec![60.0; 4],
            interval: 0.01,
            retake: Some(Retake {
                start: 0.0,
                end: 0.02,
            }),
        }];
        let result = PitchResult {
            interval: 0.05,
            pitch: vec![69.0; 10],
        };
        merge_pitch(&mut parameters, &result);
        let pitch: Vec<&Parameter> = parameters
            .iter()
            .filter(|p| p.tag == ParamTag::Pitch)
            .collect();
        assert_eq!(pitch.len(), 1);
        assert_eq!(pitch[0].values, vec![69.0; 10]);
        assert_eq!(pitch[0].interval, 0.05);

        let mut empty = Vec::new();
        merge_pitch(&mut empty, &result);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].tag, ParamTag::Pitch);
    }

    #[test]
    fn variance_merge_replaces_and_appends() {
        let mut parameters = vec![Parameter {
            tag: ParamTag::Energy,
            values: vec![0.1; 4],
            interval: 0.01,
            retake: Some(Retake {
                start: 0.0,
                end: 0.02,
            }),
        }];
        let predictions = vec![
            Parameter {
                tag: ParamTag::Energy,
                values: vec![0.5; 10],
                interval: 0.05,
                retake: None,
            },
            Parameter {
                tag: ParamTag::Breathiness,
                values: vec![0.2; 10],
                interval: 0.05,
                retake: None,
            },
        ];
        merge_variances(&mut parameters, predictions);
        assert_eq!(parameters.len(), 2);
        assert_eq!(parameters[0].tag, ParamTag::Energy);
        assert_eq!(parameters[0].values, vec![0.5; 10]);
        assert!(parameters[0].retake.is_none());
        assert_eq!(parameters[1].tag, ParamTag::Breathiness);
    }

    fn singer() -> SingerSpec {
        let frame_width = 0.05;
        let mut phonemes = std::collections::HashMap::new();
        phonemes.insert("k".to_string(), 1i64);
        phonemes.insert("a".to_string(), 2i64);

        let duration = {
            let mut config = DurationConfig::default();
            config.phonemes = phonemes.clone();
            config.frame_width = frame_width;
            config.encoder = "linguistic.onnx".into();
            config.predictor = "dur.onnx".into();
            InferenceSpec {
                kind: StageKind::Duration,
                config: StageConfig::Duration(config),
                schema: None,
                options: ImportOptions::default(),
            }
        };
        let pitch = {
            let mut config = PitchConfig::default();
            config.phonemes = phonemes.clone();
            config.frame_width = frame_width;
            config.encoder = "linguistic.onnx".into();
            config.predictor = "pitch.onnx".into();
            InferenceSpec {
                kind: StageKind::Pitch,
                config: StageConfig::Pitch(config),
                schema: None,
                options: ImportOptions::default(),
            }
        };
        let variance = {
            let mut config = VarianceConfig::default();
            config.phonemes = phonemes.clone();
            config.frame_width = frame_width;
            config.encoder = "linguistic.onnx".into();
            config.predictor = "variance.onnx".into();
            InferenceSpec {
                kind: StageKind::Variance,
                config: StageConfig::Variance(config),
                schema: Some(VarianceSchema {
                    predictions: vec![ParamTag::Energy],
                }),
                options: ImportOptions::default(),
            }
        };
        let acoustic = {
            let mut config = AcousticConfig::default();
            config.phonemes = phonemes;
            config.sample_rate = 100;
            config.hop_size = 5;
            config.parameters.insert(ParamTag::Energy);
            config.model = "acoustic.onnx".into();
            InferenceSpec {
                kind: StageKind::Acoustic,
                config: StageConfig::Acoustic(config),
                schema: None,
                options: ImportOptions::default(),
            }
        };
        let vocoder = {
            let mut config = VocoderConfig::default();
            config.sample_rate = 100;
            config.hop_size = 5;
            config.model = "vocoder.onnx".into();
            InferenceSpec {
                kind: StageKind::Vocoder,
                config: StageConfig::Vocoder(config),
                schema: None,
                options: ImportOptions::default(),
            }
        };
        SingerSpec {
            id: "demo".to_string(),
            name: "Demo".to_string(),
            imports: vec![
                Arc::new(duration),
                Arc::new(pitch),
                Arc::new(variance),
                Arc::new(acoustic),
                Arc::new(vocoder),
            ],
        }
    }

    fn score() -> ScoreDocument {
        ScoreDocument {
            singer: "demo".to_string(),
            duration: 0.5,
            words: vec![Word {
                notes: vec![Note {
                    key: 69,
                    cents: 0,
                    duration: 0.5,
                    is_rest: false,
                }],
                phones: vec![
                    Phone {
                        token: "k".to_string(),
                        language: None,
                        start: 0.0,
                        speakers: Vec::new(),
                    },
                    Phone {
                        token: "a".to_string(),
                        language: None,
                        start: 0.0,
                        speakers: Vec::new(),
                    },
                ],
            }],
            parameters: Vec::new(),
            speakers: Vec::new(),
            steps: 100,
            depth: 0.1,
        }
    }

    #[test]
    fn full_pipeline_updates_score_and_renders() {
        let driver = Arc::new(
            MockDriver::new()
                .with_output("encoder_out", Tensor::filled(vec![1, 2, 8], 0.1f32).unwrap())
                .with_output("x_masks", Tensor::filled(vec![1, 2], false).unwrap())
                .with_output(
                    "ph_dur_pred",
                    Tensor::from_vec(vec![1, 2], vec![2.0f32, 3.0]).unwrap(),
                )
                .with_output(
                    "pitch_pred",
                    Tensor::from_vec(vec![1, 10], vec![69.5f32; 10]).unwrap(),
                )
                .with_output(
                    "energy_pred",
                    Tensor::from_vec(vec![1, 10], vec![0.3f32; 10]).unwrap(),
                )
                .with_output("mel", Tensor::filled(vec![1, 10, 16], 0.5f32).unwrap())
                .with_output(
                    "waveform",
                    Tensor::from_vec(vec![1, 4], vec![0.1f32, -0.1, 0.2, -0.2]).unwrap(),
                ),
        );

        let singer = singer();
        let mut score = score();
        let output = run_pipeline(&singer, driver.clone(), &mut score).unwrap();
        assert_eq!(output.sample_rate, 100);
        assert_eq!(output.samples, vec![0.1, -0.1, 0.2, -0.2]);

        // Duration stage: predictions [2, 3] scaled to the 0.5s word.
        assert!((score.words[0].phones[0].start - 0.0).abs() < 1e-9);
        assert!((score.words[0].phones[1].start - 0.2).abs() < 1e-9);

        // Pitch and variance outputs merged into the parameter list.
        let pitch: Vec<&Parameter> = score
            .parameters
            .iter()
            .filter(|p| p.tag == ParamTag::Pitch)
            .collect();
        assert_eq!(pitch.len(), 1);
        assert_eq!(pitch[0].values, vec![69.5; 10]);
        assert_eq!(pitch[0].interval, 0.05);
        assert!(score
            .parameters
            .iter()
            .any(|p| p.tag == ParamTag::Energy && p.values == vec![0.3; 10]));

        // The acoustic stage saw the merged pitch as its F0 source.
        let acoustic_run = driver.run_requesting("mel");
        let f0 = acoustic_run.inputs["f0"].view::<f32>().unwrap();
        assert!((f0[0] - 452.89).abs() < 0.1);
    }

    #[test]
    fn missing_import_is_reported() {
        let mut singer = singer();
        singer.imports.retain(|spec| spec.kind != StageKind::Vocoder);
        let driver = Arc::new(MockDriver::new());
        let mut score = score();
        let err = run_pipeline(&singer, driver, &mut score).unwrap_err();
        assert!(err
            .to_string()
            .contains("vocoder inference not found for singer \"demo\""));
    }
}
