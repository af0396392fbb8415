//! llama.cpp backend
//!
//! Drives GGUF models through `llama-cpp-2`. The llama.cpp runtime can only
//! be initialized once per process, so live models share one runtime handle
//! and the runtime is freed when the last of them is dropped.
//!
//! `LlamaModel` and `LlamaContext` wrap raw pointers and are not `Send`;
//! they are created and dropped on the engine worker thread.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::backend::{Backend, BackendError, Session, TokenId};
use crate::inference::InitParams;

static RUNTIME: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());

/// Returns the live runtime, initializing it if no model holds it.
fn acquire_runtime() -> Result<Arc<LlamaBackend>, BackendError> {
    let mut slot = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(runtime) = slot.upgrade() {
        return Ok(runtime);
    }
    let runtime = Arc::new(
        LlamaBackend::init().map_err(|e| BackendError::RuntimeInit(e.to_string()))?,
    );
    *slot = Arc::downgrade(&runtime);
    tracing::info!("llama.cpp runtime initialized");
    Ok(runtime)
}

/// Backend loading GGUF models with llama.cpp
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaCppBackend;

/// A loaded GGUF model together with the runtime it was loaded on
pub struct LlamaCppModel {
    // Declared before `runtime` so the model is freed first.
    model: LlamaModel,
    runtime: Arc<LlamaBackend>,
}

impl Backend for LlamaCppBackend {
    type Model = LlamaCppModel;
    type Session<'m> = LlamaSession<'m>;

    fn load_model(&self, params: &InitParams) -> Result<LlamaCppModel, BackendError> {
        let runtime = acquire_runtime()?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layer_count());
        let model = LlamaModel::load_from_file(&runtime, &params.model_path, &model_params)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            params.model_path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );
        Ok(LlamaCppModel { model, runtime })
    }

    fn create_session<'m>(
        &self,
        model: &'m LlamaCppModel,
        params: &InitParams,
    ) -> Result<LlamaSession<'m>, BackendError> {
        let n_ctx = u32::try_from(params.context_size)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                BackendError::SessionCreate(format!("invalid context size {}", params.context_size))
            })?;
        // The whole prompt is decoded as one batch, so the logical batch
        // must cover the full context.
        let n_batch = params.batch_size.max(params.context_size) as u32;

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(params.thread_count)
            .with_n_threads_batch(params.thread_count);

        let ctx = model
            .model
            .new_context(&model.runtime, ctx_params)
            .map_err(|e| BackendError::SessionCreate(e.to_string()))?;

        Ok(LlamaSession {
            model: &model.model,
            ctx,
            n_past: 0,
            logits_index: 0,
        })
    }
}

/// A llama.cpp context plus its decode position
pub struct LlamaSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    n_past: i32,
    logits_index: i32,
}

impl Session for LlamaSession<'_> {
    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Err(BackendError::Evaluation("empty batch".to_string()));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(token), self.n_past + i as i32, &[0], i == last)
                .map_err(|e| BackendError::Evaluation(e.to_string()))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| BackendError::Evaluation(e.to_string()))?;

        self.n_past += tokens.len() as i32;
        self.logits_index = batch.n_tokens() - 1;
        Ok(())
    }

    fn scores(&self) -> Vec<f32> {
        self.ctx.get_logits_ith(self.logits_index).to_vec()
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|_| BackendError::Detokenization(token))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn vocab_size(&self) -> usize {
        usize::try_from(self.model.n_vocab()).unwrap_or(0)
    }
}
