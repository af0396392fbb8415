//! llm-bridge Library
//!
//! A C-callable bridge to a local text-generation engine. A host loads one
//! model with `llm_init`, asks for completions with `llm_infer` and frees
//! everything with `llm_dispose`. The same operations are available to Rust
//! callers through [`Bridge`].

pub mod backend;
pub mod bridge;
pub mod ffi;
pub mod inference;
pub mod logging;

pub use backend::{Backend, BackendError, BigramBackend, Session, TokenId};
pub use bridge::Bridge;
pub use inference::{GenerationConfig, InitParams, StatusCode};
