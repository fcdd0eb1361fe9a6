//! ONNX Runtime inference engine
//!
//! `ort` needs exclusive access to a session to run it, so each handle keeps
//! its session behind a mutex and concurrent runs on one handle are
//! serialized. Open several services for real parallelism.

use super::{InferenceEngine, ModelContract};
use crate::error::{EmbeddingError, Result};
use crate::tensor::IoSet;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Tensor;
use std::borrow::Cow;
use std::sync::Mutex;
use tracing::debug;

/// ONNX Runtime backed engine
#[derive(Debug, Clone)]
pub struct OrtEngine {
    intra_threads: usize,
}

/// A loaded ONNX model and the tensor names it is run with
pub struct OrtHandle {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OrtEngine {
    pub fn new() -> Self {
        let _ = ort::init().with_name("tokembed").commit();
        Self {
            intra_threads: num_cpus::get().max(1),
        }
    }

    /// Threads ONNX Runtime may use inside one run
    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }
}

impl Default for OrtEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn config_error(context: &'static str) -> impl FnOnce(ort::Error) -> EmbeddingError {
    move |e| EmbeddingError::Configuration(format!("{}: {}", context, e))
}

impl InferenceEngine for OrtEngine {
    type Handle = OrtHandle;

    fn open(&self, contract: &ModelContract) -> Result<OrtHandle> {
        if !contract.model_path.exists() {
            return Err(EmbeddingError::Configuration(format!(
                "model file not found at {}",
                contract.model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(config_error("session builder"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(config_error("optimization level"))?
            .with_intra_threads(self.intra_threads)
            .map_err(config_error("intra threads"))?
            .commit_from_file(&contract.model_path)
            .map_err(config_error("failed to load model"))?;

        Ok(OrtHandle {
            session: Mutex::new(session),
            input_names: contract.input_names.clone(),
            output_names: contract.output_names.clone(),
        })
    }

    fn run(&self, handle: &OrtHandle, io: &mut IoSet) -> Result<()> {
        let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            Vec::with_capacity(handle.input_names.len());
        for (name, buffer) in handle.input_names.iter().zip(io.inputs()) {
            let tensor = Tensor::from_array((buffer.shape().to_vec(), buffer.as_slice().to_vec()))?;
            inputs.push((Cow::Borrowed(name.as_str()), tensor.into()));
        }
        let inputs: SessionInputs<'_, '_> = inputs.into();

        let mut session = handle
            .session
            .lock()
            .map_err(|_| EmbeddingError::Engine("ONNX session lock poisoned".to_string()))?;
        let outputs = session.run(inputs)?;

        for (name, buffer) in handle.output_names.iter().zip(io.outputs_mut()) {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                EmbeddingError::ShapeAssertion(format!("model produced no {} output", name))
            })?;
            let (shape, data) = value.try_extract_tensor::<f32>().map_err(|e| {
                EmbeddingError::ShapeAssertion(format!("{} is not a float tensor: {}", name, e))
            })?;

            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            if dims != buffer.shape() || data.len() != buffer.len() {
                return Err(EmbeddingError::ShapeAssertion(format!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    dims,
                    buffer.shape()
                )));
            }
            buffer.as_mut_slice().copy_from_slice(data);
        }

        debug!(batch_size = io.batch_size(), "ONNX run complete");
        Ok(())
    }

    fn close(&self, handle: OrtHandle) {
        drop(handle);
        debug!("Released ONNX session");
    }
}
