//! Inference engine implementation
//!
//! Owns one loaded model and its evaluation session, and runs completions
//! against them.
//!
//! # Architecture
//!
//! Native engine handles (llama.cpp models and contexts) contain raw
//! pointers that are not `Send`, and a session borrows its model. All of
//! them therefore live on a dedicated worker thread that loads the model,
//! opens the session, and then serves generate requests one at a time over
//! a channel. The channel is the engine's serialization point: requests
//! never overlap. Dropping the [`Engine`] shuts the worker down, which
//! releases the session and then the model.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::inference::generation::{run_generation, Generation};
use crate::inference::params::GenerationConfig;
use crate::inference::sampling::{Sampler, SamplingPolicy};
use crate::inference::status::StatusCode;

/// Context size used when the caller passes a non-positive one
pub const DEFAULT_CONTEXT_SIZE: i32 = 2048;
/// Thread count used when the caller passes a non-positive one
pub const DEFAULT_THREAD_COUNT: i32 = 4;
/// Logical batch size for prompt evaluation
pub const DEFAULT_BATCH_SIZE: i32 = 256;

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid model path")]
    InvalidPath,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create session: {0}")]
    SessionCreate(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Prompt evaluation failed: {0}")]
    PromptEval(String),

    #[error("Invalid output buffer")]
    InvalidOutputBuffer,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Status code reported across the C boundary
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidPath => StatusCode::InvalidPath,
            EngineError::ModelLoad(_) => StatusCode::ModelLoadFailed,
            EngineError::SessionCreate(_) => StatusCode::SessionCreateFailed,
            EngineError::NotInitialized => StatusCode::NotInitialized,
            EngineError::PromptEval(_) | EngineError::Worker(_) => StatusCode::PromptEvalFailed,
            EngineError::InvalidOutputBuffer => StatusCode::InvalidOutputBuffer,
        }
    }
}

/// Parameters for loading a model and opening its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    /// Path to the model file
    pub model_path: PathBuf,
    /// Context window size in tokens
    pub context_size: i32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: i32,
    /// Threads used for evaluation
    pub thread_count: i32,
    /// Sampling seed (negative = fresh random seed per call)
    pub seed: i32,
    /// Logical batch size
    pub batch_size: i32,
}

impl InitParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: DEFAULT_CONTEXT_SIZE,
            gpu_layers: 0,
            thread_count: DEFAULT_THREAD_COUNT,
            seed: 0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_context_size(mut self, context_size: i32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: i32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }

    pub fn with_thread_count(mut self, thread_count: i32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces non-positive sizes and counts with their defaults
    pub fn normalized(mut self) -> Self {
        if self.context_size <= 0 {
            self.context_size = DEFAULT_CONTEXT_SIZE;
        }
        if self.thread_count <= 0 {
            self.thread_count = DEFAULT_THREAD_COUNT;
        }
        if self.batch_size <= 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        self.gpu_layers = self.gpu_layers.max(0);
        self
    }

    /// Context size in tokens (0 if not positive)
    pub fn context_len(&self) -> usize {
        usize::try_from(self.context_size).unwrap_or(0)
    }

    pub fn gpu_layer_count(&self) -> u32 {
        u32::try_from(self.gpu_layers).unwrap_or(0)
    }

    /// Seed for one call's sampler
    fn sampling_seed(&self) -> u64 {
        match u64::try_from(self.seed) {
            Ok(seed) => seed,
            Err(_) => rand::rng().random(),
        }
    }
}

/// A generate request handled by the worker
struct GenerateRequest {
    prompt: String,
    config: GenerationConfig,
    policy: SamplingPolicy,
    byte_limit: Option<usize>,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        request: GenerateRequest,
        response_tx: Sender<Result<Generation, EngineError>>,
    },
    Shutdown,
}

/// A loaded model plus session, served by a dedicated worker thread
pub struct Engine {
    id: Uuid,
    params: InitParams,
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Loads a model with `backend` and opens a session on it.
    ///
    /// Blocks until the worker reports the model and session ready. On
    /// failure nothing stays allocated: a session failure releases the model
    /// that was just loaded.
    pub fn spawn<B: Backend>(backend: B, params: InitParams) -> Result<Self, EngineError> {
        if params.model_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidPath);
        }
        let params = params.normalized();
        let id = Uuid::new_v4();

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker_params = params.clone();
        let handle = thread::Builder::new()
            .name(format!("llm-engine-{}", id.simple()))
            .spawn(move || worker_thread_main(backend, worker_params, ready_tx, command_rx))
            .map_err(|e| EngineError::ModelLoad(format!("failed to start worker: {e}")))?;

        // A worker that dies before reporting ready died while loading.
        let ready = ready_rx
            .recv()
            .map_err(|_| EngineError::ModelLoad("worker exited during load".to_string()))
            .and_then(|result| result);
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(
            engine = %id,
            "Engine ready (ctx={}, gpu_layers={}, threads={})",
            params.context_size,
            params.gpu_layers,
            params.thread_count
        );

        Ok(Self {
            id,
            params,
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Normalized parameters the engine was created with
    pub fn params(&self) -> &InitParams {
        &self.params
    }

    /// Runs one completion and blocks until it finishes.
    ///
    /// Each call gets a fresh sampler seeded from the init seed, so no
    /// repetition history or RNG state carries over between calls.
    pub fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        policy: SamplingPolicy,
        byte_limit: Option<usize>,
    ) -> Result<Generation, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| EngineError::Worker("worker stopped".to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Generate {
                request: GenerateRequest {
                    prompt: prompt.to_string(),
                    config: *config,
                    policy,
                    byte_limit,
                },
                response_tx,
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        tracing::info!(engine = %self.id, "Engine released");
    }
}

/// Worker thread main loop
///
/// Owns the model and session for the engine's whole life.
fn worker_thread_main<B: Backend>(
    backend: B,
    params: InitParams,
    ready_tx: Sender<Result<(), EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let model = match backend.load_model(&params) {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("Failed to load model {}: {}", params.model_path.display(), e);
            let _ = ready_tx.send(Err(load_error(e)));
            return;
        }
    };

    // Declared after `model`, so it is dropped first.
    let mut session = match backend.create_session(&model, &params) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to create session: {}", e);
            let _ = ready_tx.send(Err(EngineError::SessionCreate(e.to_string())));
            return;
        }
    };

    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                request,
                response_tx,
            }) => {
                let mut sampler =
                    Sampler::new(request.policy, &request.config, params.sampling_seed());
                let result = run_generation(
                    &mut session,
                    &request.prompt,
                    &request.config,
                    &mut sampler,
                    request.byte_limit,
                );
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_error(e: BackendError) -> EngineError {
    EngineError::ModelLoad(e.to_string())
}
