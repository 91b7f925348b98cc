//! Inference backend abstraction and its ONNX Runtime implementation.
//!
//! Stages talk to [`InferenceSession`] trait objects and never see `ort`
//! directly, so a session can be mocked in tests and the runtime can be
//! swapped without touching stage code. [`OrtDriver`] is the production
//! implementation: one `ort` session per model file, cooperative cancellation
//! through [`RunOptions`].

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use ndarray::ArrayViewD;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{RunOptions, Session, SessionInputValue};
use ort::value::{DynValue, Tensor as OrtTensor};

use super::error::{DiffSingerError, Result};
use super::tensor::{DType, Element, Tensor};

/// Opaque identifier of the execution provider backing the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    DirectMl,
    Cuda,
    CoreMl,
}

impl ExecutionProvider {
    /// Parse a case-insensitive provider name (`cpu`, `dml`, `directml`,
    /// `cuda`, `coreml`).
    pub fn parse(name: &str) -> Option<ExecutionProvider> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Some(ExecutionProvider::Cpu),
            "dml" | "directml" => Some(ExecutionProvider::DirectMl),
            "cuda" => Some(ExecutionProvider::Cuda),
            "coreml" => Some(ExecutionProvider::CoreMl),
            _ => None,
        }
    }
}

/// Options for opening a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOpenArgs {
    /// Force the CPU provider for this session regardless of the driver's
    /// configured provider.
    pub use_cpu: bool,
}

/// Named input tensors and requested output names for one model run.
#[derive(Debug, Clone, Default)]
pub struct SessionRunInput {
    pub inputs: HashMap<String, Arc<Tensor>>,
    pub outputs: HashSet<String>,
}

impl SessionRunInput {
    pub fn new() -> SessionRunInput {
        SessionRunInput::default()
    }

    pub fn input(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.inputs.insert(name.into(), Arc::new(tensor));
    }

    pub fn input_shared(&mut self, name: impl Into<String>, tensor: Arc<Tensor>) {
        self.inputs.insert(name.into(), tensor);
    }

    pub fn output(&mut self, name: impl Into<String>) {
        self.outputs.insert(name.into());
    }
}

/// Extracted output tensors of one model run, keyed by output name.
#[derive(Debug, Clone, Default)]
pub struct SessionResult {
    pub outputs: HashMap<String, Arc<Tensor>>,
}

/// One opened model, able to run repeatedly and to be stopped.
pub trait InferenceSession: Send {
    fn open(&mut self, model: &Path, args: &SessionOpenArgs) -> Result<()>;
    fn is_open(&self) -> bool;
    fn run(&mut self, input: &SessionRunInput) -> Result<SessionResult>;
    /// Request the running execution to halt. Returns whether the request was
    /// accepted.
    fn stop(&self) -> bool;
}

/// Factory for [`InferenceSession`]s.
pub trait InferenceDriver: Send + Sync {
    fn create_session(&self) -> Box<dyn InferenceSession>;
}

/// ONNX Runtime driver configured with a provider and device index.
pub struct OrtDriver {
    provider: ExecutionProvider,
    device_index: i32,
}

impl OrtDriver {
    pub fn new(provider: ExecutionProvider, device_index: i32) -> OrtDriver {
        OrtDriver {
            provider,
            device_index,
        }
    }
}

impl InferenceDriver for OrtDriver {
    fn create_session(&self) -> Box<dyn InferenceSession> {
        Box::new(OrtSession {
            provider: self.provider,
            device_index: self.device_index,
            session: None,
            run_options: None,
        })
    }
}

struct OrtSession {
    provider: ExecutionProvider,
    device_index: i32,
    session: Option<Session>,
    run_options: Option<Arc<RunOptions>>,
}

impl InferenceSession for OrtSession {
    fn open(&mut self, model: &Path, args: &SessionOpenArgs) -> Result<()> {
        if !model.is_file() {
            return Err(DiffSingerError::FileNotFound(model.to_path_buf()));
        }
        let provider = if args.use_cpu {
            ExecutionProvider::Cpu
        } else {
            self.provider
        };
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(execution_providers(provider, self.device_index))?
            .commit_from_file(model)?;
        log::debug!("opened ONNX session for {}", model.display());
        self.session = Some(session);
        self.run_options = Some(Arc::new(RunOptions::new()?));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn run(&mut self, input: &SessionRunInput) -> Result<SessionResult> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DiffSingerError::Session("session is not open".to_string()))?;
        let run_options = self
            .run_options
            .clone()
            .ok_or_else(|| DiffSingerError::Session("session is not open".to_string()))?;

        let mut values: Vec<(Cow<'static, str>, SessionInputValue<'static>)> =
            Vec::with_capacity(input.inputs.len());
        for (name, tensor) in &input.inputs {
            values.push((Cow::Owned(name.clone()), to_session_input(tensor)?));
        }
        let mut session_outputs = session.run_with_options(values, &run_options)?;

        let mut result = SessionResult::default();
        for name in &input.outputs {
            let Some(value) = session_outputs.remove(name.as_str()) else {
                return Err(DiffSingerError::Session(format!(
                    "output \"{}\" was not found",
                    name
                )));
            };
            result
                .outputs
                .insert(name.clone(), Arc::new(extract_tensor(name, value)?));
        }
        Ok(result)
    }

    fn stop(&self) -> bool {
        match &self.run_options {
            Some(run_options) => run_options.terminate().is_ok(),
            None => false,
        }
    }
}

fn execution_providers(
    provider: ExecutionProvider,
    device_index: i32,
) -> Vec<ExecutionProviderDispatch> {
    match provider {
        ExecutionProvider::Cpu => vec![CPUExecutionProvider::default().build()],
        ExecutionProvider::Cuda => vec![CUDAExecutionProvider::default()
            .with_device_id(device_index)
            .build()
            .error_on_failure()],
        ExecutionProvider::DirectMl => vec![DirectMLExecutionProvider::default()
            .with_device_id(device_index)
            .build()
            .error_on_failure()],
        ExecutionProvider::CoreMl => {
            vec![CoreMLExecutionProvider::default().build().error_on_failure()]
        }
    }
}

fn to_session_input(tensor: &Tensor) -> Result<SessionInputValue<'static>> {
    let shape = tensor.shape().to_vec();
    let value: DynValue = match tensor.dtype() {
        DType::Float => OrtTensor::from_array((shape, tensor.view::<f32>()?.to_vec()))?.into_dyn(),
        DType::Int64 => OrtTensor::from_array((shape, tensor.view::<i64>()?.to_vec()))?.into_dyn(),
        DType::Bool => OrtTensor::from_array((shape, tensor.view::<bool>()?.to_vec()))?.into_dyn(),
    };
    Ok(value.into())
}

fn extract_tensor(name: &str, value: DynValue) -> Result<Tensor> {
    if let Ok(view) = value.try_extract_array::<f32>() {
        return tensor_from_view(view);
    }
    if let Ok(view) = value.try_extract_array::<i64>() {
        return tensor_from_view(view);
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<bool>() {
        return Tensor::from_vec(shape.to_vec(), data.to_vec());
    }
    Err(DiffSingerError::Session(format!(
        "output \"{}\" has an unsupported element type",
        name
    )))
}

fn tensor_from_view<T: Element>(view: ArrayViewD<'_, T>) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<T> = match view.as_slice() {
        Some(slice) => slice.to_vec(),
        None => view.iter().copied().collect(),
    };
    Tensor::from_vec(shape, data)
}
