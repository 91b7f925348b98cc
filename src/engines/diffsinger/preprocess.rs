//! Preprocessing primitives shared by the synthesis stages.
//!
//! Every function here is pure and synchronous; failures are returned, never
//! panicked. Time series arrive at arbitrary sampling intervals and are
//! resampled onto the stage's frame grid before they become model inputs.

use std::collections::HashMap;

use super::error::{DiffSingerError, Result};
use super::score::{phone_count, Retake, SpeakerCurve, Word};
use super::tensor::{DType, Tensor};

/// Linearly resample `values` from `src_interval` onto `dst_interval`,
/// producing exactly `target_len` samples.
///
/// Positions past the last source sample repeat the last value when
/// `pad_with_last` is set and are zero otherwise. An empty input yields an
/// empty output; the caller decides whether that is fatal.
pub fn resample(
    values: &[f64],
    src_interval: f64,
    dst_interval: f64,
    target_len: usize,
    pad_with_last: bool,
) -> Vec<f64> {
    if values.is_empty() || target_len == 0 {
        return Vec::new();
    }
    let last = values.len() - 1;
    let mut out = Vec::with_capacity(target_len);
    for i in 0..target_len {
        let x = i as f64 * dst_interval / src_interval;
        let sample = if x >= last as f64 {
            if pad_with_last || x == last as f64 {
                values[last]
            } else {
                0.0
            }
        } else {
            let lo = x.floor() as usize;
            let t = x - lo as f64;
            values[lo] + (values[lo + 1] - values[lo]) * t
        };
        out.push(sample);
    }
    out
}

/// Replace each rest entry with the nearest non-rest value by index distance,
/// ties broken toward the lower index. Returns false when every entry is a
/// rest.
pub fn fill_rest_midi_with_nearest<T: Copy>(midi: &mut [T], is_rest: &[bool]) -> bool {
    debug_assert_eq!(midi.len(), is_rest.len());
    if midi.is_empty() {
        return true;
    }
    if is_rest.iter().all(|&r| r) {
        return false;
    }
    let source: Vec<T> = midi.to_vec();
    for i in 0..midi.len() {
        if !is_rest[i] {
            continue;
        }
        for d in 1..midi.len() {
            if i >= d && !is_rest[i - d] {
                midi[i] = source[i - d];
                break;
            }
            if i + d < midi.len() && !is_rest[i + d] {
                midi[i] = source[i + d];
                break;
            }
        }
    }
    true
}

/// Build the 1xN int64 phoneme token id tensor. Unknown tokens are an error.
pub fn phoneme_tokens(words: &[Word], phonemes: &HashMap<String, i64>) -> Result<Tensor> {
    let mut ids = Vec::with_capacity(phone_count(words));
    for word in words {
        for phone in &word.phones {
            let Some(&id) = phonemes.get(&phone.token) else {
                return Err(DiffSingerError::Session(format!(
                    "unknown phoneme token \"{}\"",
                    phone.token
                )));
            };
            ids.push(id);
        }
    }
    let shape = vec![1, ids.len() as i64];
    Tensor::from_vec(shape, ids)
}

/// Build the 1xN int64 per-phoneme language id tensor. A phoneme without a
/// language uses id 0; unknown languages are an error.
pub fn phoneme_languages(words: &[Word], languages: &HashMap<String, i64>) -> Result<Tensor> {
    let mut ids = Vec::with_capacity(phone_count(words));
    for word in words {
        for phone in &word.phones {
            let id = match &phone.language {
                None => 0,
                Some(lang) => match languages.get(lang) {
                    Some(&id) => id,
                    None => {
                        return Err(DiffSingerError::Session(format!(
                            "unknown language \"{}\"",
                            lang
                        )))
                    }
                },
            };
            ids.push(id);
        }
    }
    let shape = vec![1, ids.len() as i64];
    Tensor::from_vec(shape, ids)
}

/// Snap phoneme boundaries onto the frame grid and emit the 1xN int64 frame
/// duration tensor together with the total frame count.
///
/// Boundaries are rounded cumulatively, so the per-phoneme durations always
/// sum to the rounded total word duration.
pub fn phoneme_durations(words: &[Word], frame_width: f64) -> Result<(Tensor, i64)> {
    let mut durations = Vec::with_capacity(phone_count(words));
    let mut word_offset = 0.0;
    for word in words {
        let word_dur = word.duration();
        for (i, phone) in word.phones.iter().enumerate() {
            let entry_time = word_offset + phone.start;
            let exit_time = word_offset
                + word
                    .phones
                    .get(i + 1)
                    .map(|next| next.start)
                    .unwrap_or(word_dur);
            let entry = (entry_time / frame_width + 0.5).floor() as i64;
            let exit = (exit_time / frame_width + 0.5).floor() as i64;
            durations.push(exit - entry);
        }
        word_offset += word_dur;
    }
    let target_len = (word_offset / frame_width + 0.5).floor() as i64;
    let shape = vec![1, durations.len() as i64];
    Ok((Tensor::from_vec(shape, durations)?, target_len))
}

/// Mix speaker embedding vectors into a `1 x target_len x hidden_size` float
/// tensor, one weighted sum per frame.
///
/// Curve names go through `speaker_mapping` before the embedding lookup;
/// proportions are used as given, without renormalization.
pub fn speaker_embedding_frames(
    curves: &[SpeakerCurve],
    config_speakers: &HashMap<String, Vec<f32>>,
    speaker_mapping: &HashMap<String, String>,
    hidden_size: i64,
    frame_width: f64,
    target_len: i64,
) -> Result<Tensor> {
    let hidden = hidden_size as usize;
    let frames = target_len as usize;
    let mut tensor = Tensor::zeros(DType::Float, vec![1, target_len, hidden_size])?;
    let buffer = tensor.data_mut::<f32>()?;
    for curve in curves {
        let name = speaker_mapping.get(&curve.name).unwrap_or(&curve.name);
        let Some(embedding) = config_speakers.get(name) else {
            return Err(DiffSingerError::Session(format!(
                "unknown speaker \"{}\"",
                curve.name
            )));
        };
        if embedding.len() != hidden {
            return Err(DiffSingerError::Session(
                "speaker embedding vector length does not match hiddenSize".to_string(),
            ));
        }
        let weights = resample(&curve.values, curve.interval, frame_width, frames, true);
        if weights.len() != frames {
            return Err(DiffSingerError::Session(format!(
                "speaker \"{}\" proportion curve resample failed",
                curve.name
            )));
        }
        for (t, &weight) in weights.iter().enumerate() {
            let weight = weight as f32;
            if weight == 0.0 {
                continue;
            }
            let row = &mut buffer[t * hidden..(t + 1) * hidden];
            for (value, &emb) in row.iter_mut().zip(embedding) {
                *value += weight * emb;
            }
        }
    }
    Ok(tensor)
}

/// Convert a MIDI note number to a frequency in Hz.
pub fn midi_to_hz(note: f64) -> f64 {
    440.0 * ((note - 69.0) / 12.0).exp2()
}

/// Map a diffusion step count to the discrete speedup expected by legacy
/// models, chosen so the model's step count is `1000 / speedup`.
///
/// Continuous-acceleration models bypass this and receive the raw step count.
pub fn speedup_from_steps(steps: i64) -> i64 {
    let speedup = (1000.0 / steps as f64).round();
    speedup.clamp(1.0, 1000.0) as i64
}

/// Convert a retake boundary in seconds to a frame index clamped to
/// `[0, target_len]`. NaN, infinite and negative values fall back to
/// `default`.
pub fn retake_frame(time: f64, frame_width: f64, target_len: i64, default: i64) -> i64 {
    if time.is_finite() && time >= 0.0 {
        ((time / frame_width).round() as i64).clamp(0, target_len)
    } else {
        default
    }
}

/// Build the per-frame retake mask.
///
/// No retake window means the whole range is regenerated (all true). A
/// zero-length window pins the whole range (all false). Otherwise frames in
/// `[start, end)` are true and the rest false.
pub fn retake_mask(retake: Option<&Retake>, frame_width: f64, target_len: i64) -> Vec<bool> {
    let frames = target_len as usize;
    let mut mask = vec![true; frames];
    if let Some(retake) = retake {
        let start = retake_frame(retake.start, frame_width, target_len, 0) as usize;
        let end = retake_frame(retake.end, frame_width, target_len, target_len) as usize;
        if start == end {
            mask.fill(false);
        } else if start < end {
            mask[..start].fill(false);
            mask[end..].fill(false);
        }
    }
    mask
}
