//! Linguistic encoder input assembly and execution.
//!
//! The duration, pitch and variance predictors all share an auxiliary
//! encoder model that turns the symbolic phoneme sequence into hidden
//! features. In word mode the encoder sees per-word phoneme grouping and
//! frame-snapped word durations; in phoneme mode it sees frame-snapped
//! phoneme durations instead. Whatever the encoder emits is forwarded into
//! the predictor's input dictionary unchanged.

use std::collections::HashMap;

use super::driver::{InferenceSession, SessionRunInput};
use super::error::Result;
use super::preprocess;
use super::score::Word;
use super::tensor::Tensor;

/// Assemble encoder inputs in word mode: `tokens`, `word_div`, `word_dur`
/// and optionally `languages`.
pub fn preprocess_linguistic_word(
    words: &[Word],
    phonemes: &HashMap<String, i64>,
    languages: &HashMap<String, i64>,
    use_language_id: bool,
    frame_width: f64,
) -> Result<SessionRunInput> {
    let mut input = SessionRunInput::new();
    input.input("tokens", preprocess::phoneme_tokens(words, phonemes)?);
    if use_language_id {
        input.input(
            "languages",
            preprocess::phoneme_languages(words, languages)?,
        );
    }

    let mut word_div = Vec::with_capacity(words.len());
    let mut word_dur = Vec::with_capacity(words.len());
    let mut duration_sum = 0.0;
    for word in words {
        word_div.push(word.phones.len() as i64);
        let prev_frames = (duration_sum / frame_width + 0.5).floor() as i64;
        duration_sum += word.duration();
        let curr_frames = (duration_sum / frame_width + 0.5).floor() as i64;
        word_dur.push(curr_frames - prev_frames);
    }
    let count = words.len() as i64;
    input.input("word_div", Tensor::from_vec(vec![1, count], word_div)?);
    input.input("word_dur", Tensor::from_vec(vec![1, count], word_dur)?);
    Ok(input)
}

/// Assemble encoder inputs in phoneme mode: `tokens`, `ph_dur` and
/// optionally `languages`.
pub fn preprocess_linguistic_phoneme(
    words: &[Word],
    phonemes: &HashMap<String, i64>,
    languages: &HashMap<String, i64>,
    use_language_id: bool,
    frame_width: f64,
) -> Result<SessionRunInput> {
    let mut input = SessionRunInput::new();
    input.input("tokens", preprocess::phoneme_tokens(words, phonemes)?);
    if use_language_id {
        input.input(
            "languages",
            preprocess::phoneme_languages(words, languages)?,
        );
    }
    let (ph_dur, _) = preprocess::phoneme_durations(words, frame_width)?;
    input.input("ph_dur", ph_dur);
    Ok(input)
}

/// Run the encoder and forward its outputs into the predictor input.
///
/// `with_masks` additionally requests the `x_masks` output the duration
/// predictor consumes.
pub fn run_encoder(
    session: &mut dyn InferenceSession,
    mut encoder_input: SessionRunInput,
    predictor_input: &mut SessionRunInput,
    with_masks: bool,
) -> Result<()> {
    encoder_input.output("encoder_out");
    if with_masks {
        encoder_input.output("x_masks");
    }
    let result = session.run(&encoder_input)?;
    for (name, tensor) in result.outputs {
        predictor_input.input_shared(name, tensor);
    }
    Ok(())
}
