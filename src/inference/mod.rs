//! LLM inference engine
//!
//! This module handles engine lifecycle, per-call configuration, the token
//! generation loop and bounded output.

pub mod engine;
pub mod generation;
pub mod output;
pub mod params;
pub mod sampling;
pub mod status;

// Re-export main types for convenience
pub use engine::{Engine, EngineError, InitParams};
pub use generation::{run_generation, Generation, StopReason};
pub use output::write_bounded;
pub use params::{extract, extract_int, GenerationConfig};
pub use sampling::{Sampler, SamplingPolicy};
pub use status::StatusCode;
