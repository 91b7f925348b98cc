//! Singer package loading.
//!
//! A singer package is a directory (typically the output of the external
//! archive unpacker) holding a `package.json` descriptor next to the model
//! files it references:
//!
//! ```text
//! my-singer/
//! ├── package.json          # singers and their inference imports
//! ├── duration.json         # per-stage configuration files
//! ├── pitch.json
//! ├── variance.json
//! ├── variance.schema.json
//! ├── acoustic.json
//! ├── vocoder.json
//! ├── phonemes.json         # token -> id mapping
//! ├── *.onnx                # model graphs
//! └── *.emb                 # speaker embedding vectors
//! ```
//!
//! `package.json` lists singers, each importing exactly one inference per
//! stage class:
//!
//! ```json
//! {
//!   "singers": [{
//!     "id": "my-singer",
//!     "name": "My Singer",
//!     "imports": [
//!       {"class": "duration", "config": "duration.json"},
//!       {"class": "pitch", "config": "pitch.json"},
//!       {"class": "variance", "config": "variance.json",
//!        "schema": "variance.schema.json"},
//!       {"class": "acoustic", "config": "acoustic.json",
//!        "options": {"speakerMapping": {"lead": "alto"}}},
//!       {"class": "vocoder", "config": "vocoder.json"}
//!     ]
//!   }]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::config::{
    parse_acoustic_config, parse_duration_config, parse_import_options, parse_pitch_config,
    parse_variance_config, parse_variance_schema, parse_vocoder_config, AcousticConfig,
    DurationConfig, ImportOptions, PitchConfig, VarianceConfig, VarianceSchema, VocoderConfig,
};
use super::error::{DiffSingerError, Result};
use super::stages::StageKind;

/// Typed per-stage configuration carried by an [`InferenceSpec`].
#[derive(Debug, Clone)]
pub enum StageConfig {
    Duration(DurationConfig),
    Pitch(PitchConfig),
    Variance(VarianceConfig),
    Acoustic(AcousticConfig),
    Vocoder(VocoderConfig),
}

/// One importable inference: its stage class, configuration, optional schema
/// and per-import options.
#[derive(Debug, Clone)]
pub struct InferenceSpec {
    pub kind: StageKind,
    pub config: StageConfig,
    pub schema: Option<VarianceSchema>,
    pub options: ImportOptions,
}

impl InferenceSpec {
    pub fn duration_config(&self) -> Result<&DurationConfig> {
        match &self.config {
            StageConfig::Duration(config) => Ok(config),
            _ => Err(DiffSingerError::InvalidArgument(
                "invalid duration configuration".to_string(),
            )),
        }
    }

    pub fn pitch_config(&self) -> Result<&PitchConfig> {
        match &self.config {
            StageConfig::Pitch(config) => Ok(config),
            _ => Err(DiffSingerError::InvalidArgument(
                "invalid pitch configuration".to_string(),
            )),
        }
    }

    pub fn variance_config(&self) -> Result<&VarianceConfig> {
        match &self.config {
            StageConfig::Variance(config) => Ok(config),
            _ => Err(DiffSingerError::InvalidArgument(
                "invalid variance configuration".to_string(),
            )),
        }
    }

    pub fn acoustic_config(&self) -> Result<&AcousticConfig> {
        match &self.config {
            StageConfig::Acoustic(config) => Ok(config),
            _ => Err(DiffSingerError::InvalidArgument(
                "invalid acoustic configuration".to_string(),
            )),
        }
    }

    pub fn vocoder_config(&self) -> Result<&VocoderConfig> {
        match &self.config {
            StageConfig::Vocoder(config) => Ok(config),
            _ => Err(DiffSingerError::InvalidArgument(
                "invalid vocoder configuration".to_string(),
            )),
        }
    }

    pub fn variance_schema(&self) -> Result<&VarianceSchema> {
        self.schema.as_ref().ok_or_else(|| {
            DiffSingerError::InvalidArgument("variance schema missing".to_string())
        })
    }
}

/// A singer: identity plus its imported inferences.
#[derive(Debug, Clone)]
pub struct SingerSpec {
    pub id: String,
    pub name: String,
    pub imports: Vec<Arc<InferenceSpec>>,
}

impl SingerSpec {
    /// The first imported inference of the given stage class, if any.
    pub fn import(&self, kind: StageKind) -> Option<&Arc<InferenceSpec>> {
        self.imports.iter().find(|spec| spec.kind == kind)
    }
}

/// A loaded singer package.
#[derive(Debug, Clone)]
pub struct SingerPack {
    pub root: PathBuf,
    pub singers: Vec<SingerSpec>,
}

impl SingerPack {
    /// Open an unpacked singer package directory.
    pub fn open(root: &Path) -> Result<SingerPack> {
        let descriptor = root.join("package.json");
        let json = read_json(&descriptor)?;
        let Some(singers_json) = json.get("singers").and_then(Value::as_array) else {
            return Err(DiffSingerError::InvalidFormat(format!(
                "package descriptor {} is missing the \"singers\" array",
                descriptor.display()
            )));
        };

        let mut singers = Vec::with_capacity(singers_json.len());
        for singer_json in singers_json {
            singers.push(parse_singer(singer_json, root)?);
        }
        log::info!(
            "loaded {} singer(s) from {}",
            singers.len(),
            root.display()
        );
        Ok(SingerPack {
            root: root.to_path_buf(),
            singers,
        })
    }

    pub fn find_singer(&self, id: &str) -> Option<&SingerSpec> {
        self.singers.iter().find(|s| s.id == id)
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DiffSingerError::FileNotFound(path.to_path_buf())
        } else {
            DiffSingerError::Io(e)
        }
    })?;
    serde_json::from_str(&text)
        .map_err(|e| DiffSingerError::InvalidFormat(format!("{}: {}", path.display(), e)))
}

fn parse_singer(value: &Value, root: &Path) -> Result<SingerSpec> {
    let Some(obj) = value.as_object() else {
        return Err(DiffSingerError::InvalidFormat(
            "singer entry is not an object".to_string(),
        ));
    };
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if id.is_empty() {
        return Err(DiffSingerError::InvalidFormat(
            "singer entry is missing a non-empty \"id\"".to_string(),
        ));
    }
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    let mut imports = Vec::new();
    if let Some(imports_json) = obj.get("imports").and_then(Value::as_array) {
        for import_json in imports_json {
            if let Some(spec) = parse_import(import_json, root, &id)? {
                imports.push(Arc::new(spec));
            }
        }
    }
    Ok(SingerSpec { id, name, imports })
}

fn parse_import(value: &Value, root: &Path, singer_id: &str) -> Result<Option<InferenceSpec>> {
    let Some(obj) = value.as_object() else {
        return Err(DiffSingerError::InvalidFormat(format!(
            "import entry of singer \"{}\" is not an object",
            singer_id
        )));
    };
    let class = obj.get("class").and_then(Value::as_str).unwrap_or_default();
    let Some(kind) = StageKind::from_class(class) else {
        log::warn!(
            "singer \"{}\": ignoring import with unknown class \"{}\"",
            singer_id,
            class
        );
        return Ok(None);
    };

    let Some(config_rel) = obj.get("config").and_then(Value::as_str) else {
        return Err(DiffSingerError::InvalidFormat(format!(
            "{} import of singer \"{}\" is missing the \"config\" path",
            kind.api_name(),
            singer_id
        )));
    };
    let config_path = root.join(config_rel);
    let config_json = read_json(&config_path)?;
    let base_dir = config_path.parent().unwrap_or(root).to_path_buf();

    let config = match kind {
        StageKind::Duration => {
            StageConfig::Duration(parse_duration_config(&config_json, &base_dir)?)
        }
        StageKind::Pitch => StageConfig::Pitch(parse_pitch_config(&config_json, &base_dir)?),
        StageKind::Variance => {
            StageConfig::Variance(parse_variance_config(&config_json, &base_dir)?)
        }
        StageKind::Acoustic => {
            StageConfig::Acoustic(parse_acoustic_config(&config_json, &base_dir)?)
        }
        StageKind::Vocoder => StageConfig::Vocoder(parse_vocoder_config(&config_json, &base_dir)?),
    };

    let schema = match obj.get("schema").and_then(Value::as_str) {
        Some(schema_rel) => {
            let schema_path = root.join(schema_rel);
            let schema_json = read_json(&schema_path)?;
            let schema_base = schema_path.parent().unwrap_or(root).to_path_buf();
            Some(parse_variance_schema(&schema_json, &schema_base)?)
        }
        None => None,
    };

    let options = match obj.get("options") {
        Some(options_json) => parse_import_options(options_json, root)?,
        None => ImportOptions::default(),
    };

    Ok(Some(InferenceSpec {
        kind,
        config,
        schema,
        options,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn opens_a_minimal_package() {
        let root =
            std::env::temp_dir().join(format!("svs_pack_{}_minimal", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("phonemes.json"), r#"{"a": 1, "k": 2}"#).unwrap();
        fs::write(
            root.join("duration.json"),
            r#"{
                "phonemes": "phonemes.json",
                "frameWidth": 0.01,
                "encoder": "linguistic.onnx",
                "predictor": "dur.onnx"
            }"#,
        )
        .unwrap();
        fs::write(
            root.join("package.json"),
            r#"{
                "singers": [{
                    "id": "demo",
                    "imports": [
                        {"class": "duration", "config": "duration.json"},
                        {"class": "mystery", "config": "duration.json"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let pack = SingerPack::open(&root).unwrap();
        let singer = pack.find_singer("demo").unwrap();
        assert_eq!(singer.name, "demo");
        // The unknown class was skipped.
        assert_eq!(singer.imports.len(), 1);
        let spec = singer.import(StageKind::Duration).unwrap();
        assert_eq!(spec.duration_config().unwrap().phonemes.len(), 2);
        assert!(spec.pitch_config().is_err());
        assert!(singer.import(StageKind::Vocoder).is_none());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_descriptor_is_file_not_found() {
        let root = std::env::temp_dir().join(format!("svs_pack_{}_missing", std::process::id()));
        let err = SingerPack::open(&root).unwrap_err();
        assert!(matches!(err, DiffSingerError::FileNotFound(_)));
    }
}
