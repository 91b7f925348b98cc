//! Typed per-stage configuration, schema and import options.
//!
//! Package configuration is hand-parsed from `serde_json::Value` instead of
//! derive-mapped: a wrong field must not abort the parse. Every problem is
//! collected and the full list is returned at the end, so package authors see
//! all of them at once. Unknown fields are ignored.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::error::{DiffSingerError, Result};
use super::score::ParamTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MelBase {
    #[default]
    E,
    Ten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MelScale {
    #[default]
    Slaney,
    Htk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinguisticMode {
    #[default]
    Word,
    Phoneme,
}

#[derive(Debug, Clone, Default)]
pub struct DurationConfig {
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub hidden_size: i64,
    pub speakers: HashMap<String, Vec<f32>>,
    pub frame_width: f64,
    pub encoder: PathBuf,
    pub predictor: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PitchConfig {
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub hidden_size: i64,
    pub speakers: HashMap<String, Vec<f32>>,
    pub frame_width: f64,
    pub linguistic_mode: LinguisticMode,
    pub use_rest_flags: bool,
    pub use_expressiveness: bool,
    pub use_continuous_acceleration: bool,
    pub encoder: PathBuf,
    pub predictor: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct VarianceConfig {
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub hidden_size: i64,
    pub speakers: HashMap<String, Vec<f32>>,
    pub frame_width: f64,
    pub linguistic_mode: LinguisticMode,
    pub use_continuous_acceleration: bool,
    pub encoder: PathBuf,
    pub predictor: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AcousticConfig {
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub hidden_size: i64,
    pub speakers: HashMap<String, Vec<f32>>,
    pub sample_rate: i64,
    pub hop_size: i64,
    pub win_size: i64,
    pub fft_size: i64,
    pub mel_channels: i64,
    pub mel_min_freq: f64,
    pub mel_max_freq: f64,
    pub mel_base: MelBase,
    pub mel_scale: MelScale,
    /// Parameter tags this acoustic model accepts as conditioning inputs.
    pub parameters: BTreeSet<ParamTag>,
    pub use_variable_depth: bool,
    pub max_depth: i64,
    pub use_continuous_acceleration: bool,
    pub model: PathBuf,
}

impl Default for AcousticConfig {
    fn default() -> Self {
        AcousticConfig {
            phonemes: HashMap::new(),
            languages: HashMap::new(),
            use_language_id: false,
            use_speaker_embedding: false,
            hidden_size: 0,
            speakers: HashMap::new(),
            sample_rate: 44100,
            hop_size: 512,
            win_size: 2048,
            fft_size: 2048,
            mel_channels: 128,
            mel_min_freq: 40.0,
            mel_max_freq: 16000.0,
            mel_base: MelBase::default(),
            mel_scale: MelScale::default(),
            parameters: BTreeSet::new(),
            use_variable_depth: false,
            max_depth: 1000,
            use_continuous_acceleration: false,
            model: PathBuf::new(),
        }
    }
}

impl AcousticConfig {
    /// Seconds per frame, derived from the hop size and sample rate.
    pub fn frame_width(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone)]
pub struct VocoderConfig {
    pub sample_rate: i64,
    pub hop_size: i64,
    pub win_size: i64,
    pub fft_size: i64,
    pub mel_channels: i64,
    pub mel_min_freq: f64,
    pub mel_max_freq: f64,
    pub mel_base: MelBase,
    pub mel_scale: MelScale,
    pub model: PathBuf,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        VocoderConfig {
            sample_rate: 44100,
            hop_size: 512,
            win_size: 2048,
            fft_size: 2048,
            mel_channels: 128,
            mel_min_freq: 40.0,
            mel_max_freq: 16000.0,
            mel_base: MelBase::default(),
            mel_scale: MelScale::default(),
            model: PathBuf::new(),
        }
    }
}

/// Which variance parameters a variance model predicts.
#[derive(Debug, Clone, Default)]
pub struct VarianceSchema {
    pub predictions: Vec<ParamTag>,
}

/// Per-import options attached to a singer's use of an inference.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Renames input speaker names before the embedding lookup.
    pub speaker_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
enum ParamKind {
    All,
    Variance,
    Transition,
}

impl ParamKind {
    fn accepts(self, tag: ParamTag) -> bool {
        match self {
            ParamKind::All => tag.is_variance() || tag.is_transition(),
            ParamKind::Variance => tag.is_variance(),
            ParamKind::Transition => tag.is_transition(),
        }
    }

    fn expected(self) -> String {
        let tags: Vec<String> = ParamTag::VARIANCE
            .iter()
            .filter(|t| self.accepts(**t))
            .chain(ParamTag::TRANSITION.iter().filter(|t| self.accepts(**t)))
            .map(|t| format!("\"{}\"", t.name()))
            .collect();
        tags.join(", ")
    }
}

fn tag_from_key(key: &str, kind: ParamKind) -> Option<ParamTag> {
    ParamTag::VARIANCE
        .iter()
        .chain(ParamTag::TRANSITION.iter())
        .copied()
        .find(|tag| tag.name() == key && kind.accepts(*tag))
}

/// Error-collecting field reader over one JSON object.
struct Parser<'a> {
    obj: &'a serde_json::Map<String, Value>,
    base_dir: &'a Path,
    errors: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(value: &'a Value, base_dir: &'a Path) -> Result<Parser<'a>> {
        let obj = value.as_object().ok_or_else(|| {
            DiffSingerError::InvalidFormat("configuration is not a JSON object".to_string())
        })?;
        Ok(Parser {
            obj,
            base_dir,
            errors: Vec::new(),
        })
    }

    fn collect(&mut self, message: String) {
        self.errors.push(message);
    }

    fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DiffSingerError::Config(self.errors))
        }
    }

    fn bool_optional(&mut self, field: &str, out: &mut bool) {
        if let Some(value) = self.obj.get(field) {
            match value.as_bool() {
                Some(b) => *out = b,
                None => self.collect(format!("boolean field \"{}\" type mismatch", field)),
            }
        }
    }

    fn positive_int_optional(&mut self, field: &str, out: &mut i64) {
        if let Some(value) = self.obj.get(field) {
            match value.as_i64() {
                Some(v) if v > 0 => *out = v,
                Some(_) => self.collect(format!("integer field \"{}\" must be positive", field)),
                None => self.collect(format!("integer field \"{}\" type mismatch", field)),
            }
        }
    }

    fn positive_int_required(&mut self, field: &str, out: &mut i64) {
        if self.obj.contains_key(field) {
            self.positive_int_optional(field, out);
        } else {
            self.collect(format!("integer field \"{}\" is missing", field));
        }
    }

    fn positive_f64_optional(&mut self, field: &str, out: &mut f64) {
        if let Some(value) = self.obj.get(field) {
            match value.as_f64() {
                Some(v) if v > 0.0 => *out = v,
                Some(_) => self.collect(format!("float field \"{}\" must be positive", field)),
                None => self.collect(format!("float field \"{}\" type mismatch", field)),
            }
        }
    }

    fn path_required(&mut self, field: &str) -> PathBuf {
        match self.obj.get(field) {
            Some(Value::String(s)) => self.base_dir.join(s),
            Some(_) => {
                self.collect(format!("string field \"{}\" type mismatch", field));
                PathBuf::new()
            }
            None => {
                self.collect(format!("string field \"{}\" is missing", field));
                PathBuf::new()
            }
        }
    }

    /// `frameWidth`, or `hopSize / sampleRate` when absent.
    fn frame_width(&mut self) -> f64 {
        if let Some(value) = self.obj.get("frameWidth") {
            return match value.as_f64() {
                Some(v) if v > 0.0 => v,
                Some(_) => {
                    self.collect("float field \"frameWidth\" must be positive".to_string());
                    0.0
                }
                None => {
                    self.collect("float field \"frameWidth\" type mismatch".to_string());
                    0.0
                }
            };
        }
        match (self.obj.get("sampleRate"), self.obj.get("hopSize")) {
            (Some(sample_rate), Some(hop_size)) => {
                match (sample_rate.as_f64(), hop_size.as_f64()) {
                    (Some(sr), Some(hop)) if sr > 0.0 && hop > 0.0 => hop / sr,
                    (Some(_), Some(_)) => {
                        self.collect(
                            "integer fields \"sampleRate\" and \"hopSize\" must be positive"
                                .to_string(),
                        );
                        0.0
                    }
                    _ => {
                        self.collect(
                            "integer field \"sampleRate\" or \"hopSize\" type mismatch".to_string(),
                        );
                        0.0
                    }
                }
            }
            _ => {
                self.collect(
                    "must specify either \"frameWidth\" or (\"sampleRate\" and \"hopSize\")"
                        .to_string(),
                );
                0.0
            }
        }
    }

    fn mel_base_optional(&mut self, out: &mut MelBase) {
        if let Some(value) = self.obj.get("melBase") {
            let text = value.as_str().unwrap_or_default().to_ascii_lowercase();
            match text.as_str() {
                "e" => *out = MelBase::E,
                "10" => *out = MelBase::Ten,
                other => self.collect(format!(
                    "enum string field \"melBase\" invalid: expect \"e\", \"10\"; got \"{}\"",
                    other
                )),
            }
        }
    }

    fn mel_scale_optional(&mut self, out: &mut MelScale) {
        if let Some(value) = self.obj.get("melScale") {
            let text = value.as_str().unwrap_or_default().to_ascii_lowercase();
            match text.as_str() {
                "slaney" => *out = MelScale::Slaney,
                "htk" => *out = MelScale::Htk,
                other => self.collect(format!(
                    "enum string field \"melScale\" invalid: expect \"slaney\", \"htk\"; got \"{}\"",
                    other
                )),
            }
        }
    }

    fn linguistic_mode_optional(&mut self, out: &mut LinguisticMode) {
        if let Some(value) = self.obj.get("linguisticMode") {
            let text = value.as_str().unwrap_or_default().to_ascii_lowercase();
            match text.as_str() {
                "word" => *out = LinguisticMode::Word,
                "phoneme" => *out = LinguisticMode::Phoneme,
                other => self.collect(format!(
                    "enum string field \"linguisticMode\" invalid: expect \"word\", \"phoneme\"; got \"{}\"",
                    other
                )),
            }
        }
    }

    fn hidden_size(&mut self, use_speaker_embedding: bool, out: &mut i64) {
        if self.obj.contains_key("hiddenSize") {
            let mut value = 0;
            self.positive_int_optional("hiddenSize", &mut value);
            *out = value;
        } else if use_speaker_embedding {
            self.collect(
                "integer field \"hiddenSize\" is missing (required when \"useSpeakerEmbedding\" is set to true)"
                    .to_string(),
            );
        }
    }

    /// Parse the `phonemes`/`languages` field: a path to a JSON file mapping
    /// names to integer ids.
    fn id_mapping(&mut self, field: &str, required: bool, out: &mut HashMap<String, i64>) {
        let Some(value) = self.obj.get(field) else {
            if required {
                if field == "languages" {
                    self.collect(
                        "string field \"languages\" is missing (required when \"useLanguageId\" is set to true)"
                            .to_string(),
                    );
                } else {
                    self.collect(format!("string field \"{}\" is missing", field));
                }
            }
            return;
        };
        let Some(rel) = value.as_str() else {
            self.collect(format!("string field \"{}\" type mismatch", field));
            return;
        };
        let path = self.base_dir.join(rel);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                self.collect(format!(
                    "error loading \"{}\": {} file not found",
                    field,
                    path.display()
                ));
                return;
            }
        };
        let json: Value = match serde_json::from_str(&text) {
            Ok(json) => json,
            Err(e) => {
                self.collect(format!("error loading \"{}\": {}", field, e));
                return;
            }
        };
        let Some(obj) = json.as_object() else {
            self.collect(format!(
                "error loading \"{}\": outer JSON is not an object",
                field
            ));
            return;
        };
        for (key, value) in obj {
            match value.as_i64() {
                Some(id) => {
                    out.insert(key.clone(), id);
                }
                None => self.collect(format!(
                    "error loading \"{}\": value of key \"{}\" is not int",
                    field, key
                )),
            }
        }
    }

    /// Parse the `speakers` object and load each `.emb` file: raw
    /// little-endian float32, exactly `hidden_size` elements.
    fn speakers(
        &mut self,
        use_speaker_embedding: bool,
        hidden_size: i64,
        out: &mut HashMap<String, Vec<f32>>,
    ) {
        let Some(value) = self.obj.get("speakers") else {
            if use_speaker_embedding {
                self.collect(
                    "object field \"speakers\" is missing (required when \"useSpeakerEmbedding\" is set to true)"
                        .to_string(),
                );
            }
            return;
        };
        let Some(obj) = value.as_object() else {
            self.collect("object field \"speakers\" type mismatch".to_string());
            return;
        };
        for (name, value) in obj {
            let Some(rel) = value.as_str() else {
                self.collect(
                    "object field \"speakers\" values type mismatch: string expected".to_string(),
                );
                continue;
            };
            let path = self.base_dir.join(rel);
            match load_speaker_embedding(hidden_size, &path) {
                Ok(embedding) => {
                    out.insert(name.clone(), embedding);
                }
                Err(message) => self.collect(format!(
                    "could not load speaker (\"{}\") embedding vector from {}: {}",
                    name,
                    path.display(),
                    message
                )),
            }
        }
    }

    fn parameters(&mut self, field: &str, kind: ParamKind, mut insert: impl FnMut(ParamTag)) {
        let Some(value) = self.obj.get(field) else {
            return;
        };
        let Some(array) = value.as_array() else {
            self.collect(format!("array field \"{}\" type mismatch", field));
            return;
        };
        for (index, item) in array.iter().enumerate() {
            let Some(key) = item.as_str() else {
                self.collect(format!(
                    "array field \"{}\" element at index {} type mismatch: expected string",
                    field, index
                ));
                continue;
            };
            match tag_from_key(key, kind) {
                Some(tag) => insert(tag),
                None => self.collect(format!(
                    "array field \"{}\" element at index {} invalid: expected one of [{}]; got \"{}\"",
                    field,
                    index,
                    kind.expected(),
                    key
                )),
            }
        }
    }
}

/// Load a speaker embedding vector from a raw `.emb` file.
fn load_speaker_embedding(hidden_size: i64, path: &Path) -> std::result::Result<Vec<f32>, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let expected = hidden_size.max(0) as usize * 4;
    if bytes.len() != expected {
        return Err(format!(
            "expected {} bytes for hiddenSize {}, got {}",
            expected,
            hidden_size,
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn parse_duration_config(value: &Value, base_dir: &Path) -> Result<DurationConfig> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut config = DurationConfig::default();
    parser.bool_optional("useLanguageId", &mut config.use_language_id);
    parser.bool_optional("useSpeakerEmbedding", &mut config.use_speaker_embedding);
    parser.id_mapping("phonemes", true, &mut config.phonemes);
    parser.id_mapping("languages", config.use_language_id, &mut config.languages);
    parser.hidden_size(config.use_speaker_embedding, &mut config.hidden_size);
    parser.speakers(
        config.use_speaker_embedding,
        config.hidden_size,
        &mut config.speakers,
    );
    config.frame_width = parser.frame_width();
    config.encoder = parser.path_required("encoder");
    config.predictor = parser.path_required("predictor");
    parser.finish()?;
    Ok(config)
}

pub fn parse_pitch_config(value: &Value, base_dir: &Path) -> Result<PitchConfig> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut config = PitchConfig::default();
    parser.bool_optional("useLanguageId", &mut config.use_language_id);
    parser.bool_optional("useSpeakerEmbedding", &mut config.use_speaker_embedding);
    parser.bool_optional("useRestFlags", &mut config.use_rest_flags);
    parser.bool_optional("useExpressiveness", &mut config.use_expressiveness);
    parser.bool_optional(
        "useContinuousAcceleration",
        &mut config.use_continuous_acceleration,
    );
    parser.linguistic_mode_optional(&mut config.linguistic_mode);
    parser.id_mapping("phonemes", true, &mut config.phonemes);
    parser.id_mapping("languages", config.use_language_id, &mut config.languages);
    parser.hidden_size(config.use_speaker_embedding, &mut config.hidden_size);
    parser.speakers(
        config.use_speaker_embedding,
        config.hidden_size,
        &mut config.speakers,
    );
    config.frame_width = parser.frame_width();
    config.encoder = parser.path_required("encoder");
    config.predictor = parser.path_required("predictor");
    parser.finish()?;
    Ok(config)
}

pub fn parse_variance_config(value: &Value, base_dir: &Path) -> Result<VarianceConfig> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut config = VarianceConfig::default();
    parser.bool_optional("useLanguageId", &mut config.use_language_id);
    parser.bool_optional("useSpeakerEmbedding", &mut config.use_speaker_embedding);
    parser.bool_optional(
        "useContinuousAcceleration",
        &mut config.use_continuous_acceleration,
    );
    parser.linguistic_mode_optional(&mut config.linguistic_mode);
    parser.id_mapping("phonemes", true, &mut config.phonemes);
    parser.id_mapping("languages", config.use_language_id, &mut config.languages);
    parser.hidden_size(config.use_speaker_embedding, &mut config.hidden_size);
    parser.speakers(
        config.use_speaker_embedding,
        config.hidden_size,
        &mut config.speakers,
    );
    config.frame_width = parser.frame_width();
    config.encoder = parser.path_required("encoder");
    config.predictor = parser.path_required("predictor");
    parser.finish()?;
    Ok(config)
}

pub fn parse_acoustic_config(value: &Value, base_dir: &Path) -> Result<AcousticConfig> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut config = AcousticConfig::default();
    parser.bool_optional("useLanguageId", &mut config.use_language_id);
    parser.bool_optional("useSpeakerEmbedding", &mut config.use_speaker_embedding);
    parser.bool_optional("useVariableDepth", &mut config.use_variable_depth);
    parser.bool_optional(
        "useContinuousAcceleration",
        &mut config.use_continuous_acceleration,
    );
    parser.id_mapping("phonemes", true, &mut config.phonemes);
    parser.id_mapping("languages", config.use_language_id, &mut config.languages);
    parser.hidden_size(config.use_speaker_embedding, &mut config.hidden_size);
    parser.speakers(
        config.use_speaker_embedding,
        config.hidden_size,
        &mut config.speakers,
    );
    parser.positive_int_required("sampleRate", &mut config.sample_rate);
    parser.positive_int_required("hopSize", &mut config.hop_size);
    parser.positive_int_optional("winSize", &mut config.win_size);
    parser.positive_int_optional("fftSize", &mut config.fft_size);
    parser.positive_int_optional("melChannels", &mut config.mel_channels);
    parser.positive_f64_optional("melMinFreq", &mut config.mel_min_freq);
    parser.positive_f64_optional("melMaxFreq", &mut config.mel_max_freq);
    parser.mel_base_optional(&mut config.mel_base);
    parser.mel_scale_optional(&mut config.mel_scale);
    parser.positive_int_optional("maxDepth", &mut config.max_depth);
    let parameters = &mut config.parameters;
    parser.parameters("parameters", ParamKind::All, |tag| {
        parameters.insert(tag);
    });
    config.model = parser.path_required("model");
    parser.finish()?;
    Ok(config)
}

pub fn parse_vocoder_config(value: &Value, base_dir: &Path) -> Result<VocoderConfig> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut config = VocoderConfig::default();
    parser.positive_int_required("sampleRate", &mut config.sample_rate);
    parser.positive_int_required("hopSize", &mut config.hop_size);
    parser.positive_int_optional("winSize", &mut config.win_size);
    parser.positive_int_optional("fftSize", &mut config.fft_size);
    parser.positive_int_optional("melChannels", &mut config.mel_channels);
    parser.positive_f64_optional("melMinFreq", &mut config.mel_min_freq);
    parser.positive_f64_optional("melMaxFreq", &mut config.mel_max_freq);
    parser.mel_base_optional(&mut config.mel_base);
    parser.mel_scale_optional(&mut config.mel_scale);
    config.model = parser.path_required("model");
    parser.finish()?;
    Ok(config)
}

pub fn parse_variance_schema(value: &Value, base_dir: &Path) -> Result<VarianceSchema> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut schema = VarianceSchema::default();
    let predictions = &mut schema.predictions;
    parser.parameters("predictions", ParamKind::Variance, |tag| {
        if !predictions.contains(&tag) {
            predictions.push(tag);
        }
    });
    parser.finish()?;
    Ok(schema)
}

pub fn parse_import_options(value: &Value, base_dir: &Path) -> Result<ImportOptions> {
    let mut parser = Parser::new(value, base_dir)?;
    let mut options = ImportOptions::default();
    if let Some(value) = parser.obj.get("speakerMapping") {
        match value.as_object() {
            Some(obj) => {
                for (from, to) in obj {
                    match to.as_str() {
                        Some(to) => {
                            options.speaker_mapping.insert(from.clone(), to.to_string());
                        }
                        None => parser.collect(
                            "object field \"speakerMapping\" values type mismatch: string expected"
                                .to_string(),
                        ),
                    }
                }
            }
            None => {
                parser.collect("object field \"speakerMapping\" type mismatch".to_string());
            }
        }
    }
    parser.finish()?;
    Ok(options)
}
