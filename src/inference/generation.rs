//! Generation loop
//!
//! Evaluates the prompt in one batch, then samples, detokenizes and feeds
//! back one token at a time until a stop condition is met.

use crate::backend::{Session, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::params::GenerationConfig;
use crate::inference::sampling::Sampler;

/// Why a generation ended. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The token budget was used up
    MaxTokens,
    /// The engine produced an end-of-sequence or invalid token
    EndOfSequence,
    /// The output reached the caller's byte limit
    CapacityReached,
    /// Feeding a generated token back failed; output so far is kept
    StepEvalFailed,
}

/// Output of one generate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Raw generated bytes (not necessarily valid UTF-8 when truncated)
    pub text: Vec<u8>,
    /// Number of tokens sampled and appended
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

impl Generation {
    /// Generated text, with invalid UTF-8 replaced
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.text).into_owned()
    }
}

/// Runs one completion against `session`.
///
/// Fails only when the prompt cannot be tokenized or evaluated. Once the
/// prompt is in, every later engine failure ends the loop early and the
/// text produced so far is returned as a success.
///
/// `byte_limit` bounds the accumulated output: the loop stops as soon as the
/// text is at least that long.
pub fn run_generation<S: Session + ?Sized>(
    session: &mut S,
    prompt: &str,
    config: &GenerationConfig,
    sampler: &mut Sampler,
    byte_limit: Option<usize>,
) -> Result<Generation, EngineError> {
    let tokens = session
        .tokenize(prompt, true)
        .map_err(|e| EngineError::PromptEval(e.to_string()))?;
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    session
        .evaluate(&tokens)
        .map_err(|e| EngineError::PromptEval(e.to_string()))?;

    let vocab_size = session.vocab_size();
    let mut text: Vec<u8> = Vec::new();
    let mut tokens_generated = 0;
    let mut stop_reason = StopReason::MaxTokens;

    for _ in 0..config.token_budget() {
        let scores = session.scores();
        let token = match sampler.sample(&scores) {
            Some(token) if is_in_vocab(token, vocab_size) => token,
            _ => {
                tracing::debug!("Sampler produced no valid token");
                stop_reason = StopReason::EndOfSequence;
                break;
            }
        };
        sampler.accept(token);

        if session.is_end_of_sequence(token) {
            tracing::debug!("End of generation token encountered");
            stop_reason = StopReason::EndOfSequence;
            break;
        }

        match session.token_to_piece(token) {
            Ok(piece) => text.extend_from_slice(&piece),
            Err(e) => tracing::debug!("Skipping token without text: {}", e),
        }
        tokens_generated += 1;

        if byte_limit.is_some_and(|limit| text.len() >= limit) {
            stop_reason = StopReason::CapacityReached;
            break;
        }

        if let Err(e) = session.evaluate(&[token]) {
            tracing::warn!("Step evaluation failed, stopping early: {}", e);
            stop_reason = StopReason::StepEvalFailed;
            break;
        }
    }

    tracing::debug!(
        "Generated {} tokens ({} bytes), stop: {:?}",
        tokens_generated,
        text.len(),
        stop_reason
    );

    Ok(Generation {
        text,
        tokens_generated,
        stop_reason,
    })
}

fn is_in_vocab(token: TokenId, vocab_size: usize) -> bool {
    usize::try_from(token).is_ok_and(|t| t < vocab_size)
}
