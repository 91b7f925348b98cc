//! The DiffSinger engine front end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{RenderedAudio, SynthesisEngine};

use super::driver::{ExecutionProvider, InferenceDriver, OrtDriver};
use super::error::{DiffSingerError, Result};
use super::package::SingerPack;
use super::pipeline::run_pipeline;
use super::score::ScoreDocument;

/// Backend settings fixed when a package is opened.
#[derive(Debug, Clone, Default)]
pub struct DiffSingerSettings {
    /// Execution provider backing every model session.
    pub provider: ExecutionProvider,
    /// Device index for GPU providers.
    pub device_index: i32,
}

/// Options for a single render.
#[derive(Debug, Clone, Default)]
pub struct DiffSingerRenderOptions {
    /// Render with this singer instead of the one named by the score.
    pub singer: Option<String>,
}

/// Singing-voice synthesis engine for packaged DiffSinger-style singers.
///
/// # Quick Start
///
/// ```rust,no_run
/// use svs_rs::{SynthesisEngine, engines::diffsinger::{DiffSingerEngine, ScoreDocument}};
/// use std::path::Path;
///
/// let mut engine = DiffSingerEngine::new();
/// engine.load_package(Path::new("singers/my-singer"), Default::default())?;
///
/// let score = ScoreDocument::load(Path::new("score.json"))?;
/// engine.render(&score)?.write_wav(Path::new("output.wav"))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct DiffSingerEngine {
    pack: Option<SingerPack>,
    package_path: Option<PathBuf>,
    driver: Option<Arc<dyn InferenceDriver>>,
}

impl Default for DiffSingerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffSingerEngine {
    pub fn new() -> DiffSingerEngine {
        DiffSingerEngine {
            pack: None,
            package_path: None,
            driver: None,
        }
    }

    /// Path of the currently loaded package, if any.
    pub fn package_path(&self) -> Option<&Path> {
        self.package_path.as_deref()
    }

    /// List the singer ids available in the loaded package.
    pub fn list_singers(&self) -> Vec<&str> {
        self.pack
            .as_ref()
            .map(|pack| pack.singers.iter().map(|s| s.id.as_str()).collect())
            .unwrap_or_default()
    }

    /// Load a package, creating the backend driver for the given settings.
    pub fn open_package(&mut self, package_path: &Path, settings: &DiffSingerSettings) -> Result<()> {
        let pack = SingerPack::open(package_path)?;
        self.driver = Some(Arc::new(OrtDriver::new(
            settings.provider,
            settings.device_index,
        )));
        self.pack = Some(pack);
        self.package_path = Some(package_path.to_path_buf());
        Ok(())
    }

    /// Render a score with the loaded package.
    pub fn render_score(
        &mut self,
        score: &ScoreDocument,
        options: &DiffSingerRenderOptions,
    ) -> Result<RenderedAudio> {
        let (Some(pack), Some(driver)) = (&self.pack, &self.driver) else {
            return Err(DiffSingerError::InvalidArgument(
                "no singer package loaded".to_string(),
            ));
        };
        let singer_id = options.singer.as_deref().unwrap_or(&score.singer);
        let Some(singer) = pack.find_singer(singer_id) else {
            return Err(DiffSingerError::InvalidArgument(format!(
                "singer \"{}\" not found in package",
                singer_id
            )));
        };

        // The pipeline annotates the score stage by stage; keep the caller's
        // document untouched.
        let mut working = score.clone();
        let output = run_pipeline(singer, driver.clone(), &mut working)?;
        Ok(RenderedAudio {
            samples: output.samples,
            sample_rate: output.sample_rate,
        })
    }
}

impl Drop for DiffSingerEngine {
    fn drop(&mut self) {
        self.unload_package();
    }
}

impl SynthesisEngine for DiffSingerEngine {
    type Score = ScoreDocument;
    type Settings = DiffSingerSettings;

    fn load_package(
        &mut self,
        package: &Path,
        settings: Self::Settings,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        self.open_package(package, &settings)?;
        Ok(())
    }

    fn unload_package(&mut self) {
        self.pack = None;
        self.package_path = None;
        self.driver = None;
    }

    fn singers(&self) -> Vec<&str> {
        self.list_singers()
    }

    fn render(
        &mut self,
        score: &Self::Score,
    ) -> std::result::Result<RenderedAudio, Box<dyn std::error::Error>> {
        Ok(self.render_score(score, &DiffSingerRenderOptions::default())?)
    }
}
