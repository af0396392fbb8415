//! Byte-level bigram engine
//!
//! A tiny deterministic language model: the "model file" is a plain-text
//! corpus, every non-empty line is one training sequence framed by
//! beginning- and end-of-sequence tokens, and the score of each next token
//! is derived from how often it followed the current one in the corpus.
//!
//! It behaves like a native engine where the bridge can observe it: the
//! context window is finite and evaluation fails once it is full, sessions
//! keep their position across calls, and opening a session with a context
//! larger than the model supports fails.

use std::fs;

use crate::backend::{Backend, BackendError, Session, TokenId};
use crate::inference::InitParams;

/// Beginning-of-sequence token
pub const BOS: TokenId = 256;
/// End-of-sequence token
pub const EOS: TokenId = 257;
/// Byte tokens plus the two framing tokens
pub const VOCAB_SIZE: usize = 258;
/// Largest context a bigram session accepts
pub const MAX_CONTEXT: usize = 32_768;

/// Backend producing [`BigramModel`]s from corpus files
#[derive(Debug, Clone, Copy, Default)]
pub struct BigramBackend;

impl Backend for BigramBackend {
    type Model = BigramModel;
    type Session<'m> = BigramSession<'m>;

    fn load_model(&self, params: &InitParams) -> Result<BigramModel, BackendError> {
        let corpus = fs::read_to_string(&params.model_path).map_err(|e| {
            BackendError::ModelLoad(format!("{}: {}", params.model_path.display(), e))
        })?;
        let model = BigramModel::from_corpus(&corpus);
        if model.sequences == 0 {
            return Err(BackendError::ModelLoad(format!(
                "{}: corpus has no sequences",
                params.model_path.display()
            )));
        }
        tracing::debug!(
            "Bigram model loaded from {} ({} sequences)",
            params.model_path.display(),
            model.sequences
        );
        Ok(model)
    }

    fn create_session<'m>(
        &self,
        model: &'m BigramModel,
        params: &InitParams,
    ) -> Result<BigramSession<'m>, BackendError> {
        let context_size = params.context_len();
        if context_size > MAX_CONTEXT {
            return Err(BackendError::SessionCreate(format!(
                "context size {} exceeds model maximum {}",
                context_size, MAX_CONTEXT
            )));
        }
        Ok(BigramSession {
            model,
            context_size,
            position: 0,
            last: None,
        })
    }
}

/// Transition counts between consecutive tokens
#[derive(Debug, Clone)]
pub struct BigramModel {
    counts: Vec<u32>,
    sequences: usize,
}

impl BigramModel {
    /// Builds a model from corpus text, one sequence per non-empty line.
    pub fn from_corpus(corpus: &str) -> Self {
        let mut model = Self {
            counts: vec![0; VOCAB_SIZE * VOCAB_SIZE],
            sequences: 0,
        };
        for line in corpus.lines().filter(|l| !l.is_empty()) {
            let mut prev = BOS;
            for &byte in line.as_bytes() {
                model.observe(prev, TokenId::from(byte));
                prev = TokenId::from(byte);
            }
            model.observe(prev, EOS);
            model.sequences += 1;
        }
        model
    }

    fn observe(&mut self, prev: TokenId, next: TokenId) {
        self.counts[prev as usize * VOCAB_SIZE + next as usize] += 1;
    }

    /// How often `next` followed `prev` in the corpus.
    pub fn count(&self, prev: TokenId, next: TokenId) -> u32 {
        if !is_valid(prev) || !is_valid(next) {
            return 0;
        }
        self.counts[prev as usize * VOCAB_SIZE + next as usize]
    }

    /// Number of training sequences.
    pub fn sequences(&self) -> usize {
        self.sequences
    }
}

fn is_valid(token: TokenId) -> bool {
    (0..VOCAB_SIZE as TokenId).contains(&token)
}

/// Session over a [`BigramModel`]
#[derive(Debug)]
pub struct BigramSession<'m> {
    model: &'m BigramModel,
    context_size: usize,
    position: usize,
    last: Option<TokenId>,
}

impl BigramSession<'_> {
    /// Number of tokens evaluated so far.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Session for BigramSession<'_> {
    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        Ok(tokens)
    }

    fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        let Some(&last) = tokens.last() else {
            return Err(BackendError::Evaluation("empty batch".to_string()));
        };
        if let Some(&bad) = tokens.iter().find(|&&t| !is_valid(t)) {
            return Err(BackendError::Evaluation(format!("invalid token {}", bad)));
        }
        if self.position + tokens.len() > self.context_size {
            return Err(BackendError::Evaluation(format!(
                "context full ({} + {} > {})",
                self.position,
                tokens.len(),
                self.context_size
            )));
        }
        self.position += tokens.len();
        self.last = Some(last);
        Ok(())
    }

    fn scores(&self) -> Vec<f32> {
        match self.last {
            Some(prev) => (0..VOCAB_SIZE as TokenId)
                .map(|next| (self.model.count(prev, next) as f32).ln_1p())
                .collect(),
            None => vec![0.0; VOCAB_SIZE],
        }
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        match u8::try_from(token) {
            Ok(byte) => Ok(vec![byte]),
            Err(_) if token == BOS || token == EOS => Ok(Vec::new()),
            Err(_) => Err(BackendError::Detokenization(token)),
        }
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Writes `corpus` to a temporary model file.
#[cfg(test)]
pub(crate) fn corpus_file(corpus: &str) -> tempfile::NamedTempFile {
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    file.write_all(corpus.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
