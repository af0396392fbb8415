//! Generation backends
//!
//! The bridge treats the text-generation engine as a black box: it loads a
//! model, opens a session on it, and then drives that session through
//! tokenize / evaluate / score / detokenize calls. Everything numeric lives
//! behind these two traits.
//!
//! Sessions may borrow their model (llama.cpp contexts do), so a backend's
//! session type is generic over the model lifetime and both are owned by the
//! engine's worker thread for their whole life.

use thiserror::Error;

use crate::inference::InitParams;

pub mod bigram;
#[cfg(feature = "llama")]
pub mod llama;

pub use bigram::BigramBackend;
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;

/// Token id type (i32 to match the native engines; valid ids are non-negative).
pub type TokenId = i32;

/// Errors reported by a backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Failed to initialize runtime: {0}")]
    RuntimeInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create session: {0}")]
    SessionCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Failed to convert token {0} to text")]
    Detokenization(TokenId),
}

/// A generation engine that can load models and open sessions on them.
///
/// Implementations are moved onto the engine worker thread, so they must be
/// `Send`; the models and sessions they produce never leave that thread.
pub trait Backend: Send + 'static {
    /// A loaded model.
    type Model;

    /// Mutable evaluation state opened on a model.
    type Session<'m>: Session
    where
        Self: 'm,
        Self::Model: 'm;

    /// Loads the model at `params.model_path`.
    fn load_model(&self, params: &InitParams) -> Result<Self::Model, BackendError>;

    /// Opens an evaluation session on a loaded model.
    fn create_session<'m>(
        &self,
        model: &'m Self::Model,
        params: &InitParams,
    ) -> Result<Self::Session<'m>, BackendError>;
}

/// Evaluation state of one loaded model.
pub trait Session {
    /// Converts text into tokens. With `add_special`, framing tokens
    /// (beginning-of-sequence and similar) are included.
    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Feeds tokens to the session, advancing its position.
    fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Score of every vocabulary entry for the next position.
    fn scores(&self) -> Vec<f32>;

    /// Raw bytes of one token. May be empty for control tokens.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    /// Whether `token` ends generation.
    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Number of entries in the vocabulary.
    fn vocab_size(&self) -> usize;
}
