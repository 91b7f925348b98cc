//! Vocoder stage: mel spectrogram plus F0 in, waveform out.

use std::sync::{Arc, RwLock};

use crate::engines::diffsinger::driver::{
    InferenceDriver, InferenceSession, SessionOpenArgs, SessionRunInput,
};
use crate::engines::diffsinger::error::{DiffSingerError, Result};
use crate::engines::diffsinger::package::InferenceSpec;
use crate::engines::diffsinger::tensor::Tensor;

use super::{check_init_args, read_lock, write_lock, StageKind, StateCell, TaskInitArgs, TaskState};

pub struct VocoderStartInput {
    pub mel: Arc<Tensor>,
    pub f0: Arc<Tensor>,
}

#[derive(Debug, Clone)]
pub struct VocoderResult {
    /// Mono float32 samples at the vocoder's sample rate.
    pub samples: Vec<f32>,
}

struct Inner {
    session: Option<Box<dyn InferenceSession>>,
    result: Option<Arc<VocoderResult>>,
}

pub struct VocoderInference {
    spec: Arc<InferenceSpec>,
    driver: Arc<dyn InferenceDriver>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl VocoderInference {
    pub fn new(spec: Arc<InferenceSpec>, driver: Arc<dyn InferenceDriver>) -> VocoderInference {
        VocoderInference {
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

    pub fn result(&self) -> Option<Arc<VocoderResult>> {
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
        check_init_args(StageKind::Vocoder, args)?;
        let config = self.spec.vocoder_config()?;

        let mut inner = write_lock(&self.inner);
        inner.result = None;

        let mut session = self.driver.create_session();
        session.open(&config.model, &SessionOpenArgs::default())?;
        inner.session = Some(session);
        drop(inner);

        self.state.set(TaskState::Idle);
        Ok(())
    }

    pub fn start(&self, input: &VocoderStartInput) -> Result<Arc<VocoderResult>> {
        {
            let inner = read_lock(&self.inner);
            if inner.session.is_none() {
                self.state.set(TaskState::Failed);
                return Err(DiffSingerError::Session(
                    "vocoder inference is not initialized".to_string(),
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

    pub fn start_async(&self, _input: &VocoderStartInput) -> Result<()> {
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

    fn run(&self, input: &VocoderStartInput) -> Result<Arc<VocoderResult>> {
        let mut session_input = SessionRunInput::new();
        session_input.input_shared("mel", input.mel.clone());
        session_input.input_shared("f0", input.f0.clone());
        session_input.output("waveform");

        let session_result = {
            let mut inner = write_lock(&self.inner);
            let session = inner
                .session
                .as_mut()
                .filter(|s| s.is_open())
                .ok_or_else(|| {
                    DiffSingerError::Session("vocoder session is not initialized".to_string())
                })?;
            session.run(&session_input)?
        };

        let Some(waveform) = session_result.outputs.get("waveform") else {
            return Err(DiffSingerError::Session("invalid result output".to_string()));
        };
        let samples = waveform
            .view::<f32>()
            .map_err(|_| DiffSingerError::Session("model output is not float".to_string()))?
            .to_vec();

        let result = Arc::new(VocoderResult { samples });
        write_lock(&self.inner).result = Some(result.clone());
        Ok(result)
    }
}
