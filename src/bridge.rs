//! Engine slot behind the exported entry points
//!
//! A [`Bridge`] holds at most one [`Engine`] and runs init, generate and
//! dispose under a single lock, so none of them ever overlap. The C ABI uses
//! one process-wide bridge; Rust callers and tests can create as many
//! independent bridges as they like.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::Backend;
use crate::inference::{
    write_bounded, Engine, EngineError, GenerationConfig, InitParams, SamplingPolicy, StatusCode,
};

pub struct Bridge<B> {
    backend: B,
    engine: Mutex<Option<Engine>>,
}

impl<B: Backend + Clone> Bridge<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            engine: Mutex::new(None),
        }
    }

    // The slot is only ever replaced wholesale, so a panic while it was held
    // cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, Option<Engine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Loads a model and opens its session.
    ///
    /// A no-op success when an engine is already installed, whatever the
    /// arguments. On failure no engine is installed and init can be retried.
    pub fn init(
        &self,
        model_path: Option<&str>,
        context_size: i32,
        gpu_layers: i32,
        thread_count: i32,
        seed: i32,
    ) -> StatusCode {
        let mut slot = self.lock();
        if slot.is_some() {
            tracing::warn!("init: engine already initialized");
            return StatusCode::Ok;
        }
        let Some(model_path) = model_path.filter(|p| !p.is_empty()) else {
            tracing::error!("init: invalid model path");
            return StatusCode::InvalidPath;
        };

        let params = InitParams::new(model_path)
            .with_context_size(context_size)
            .with_gpu_layers(gpu_layers)
            .with_thread_count(thread_count)
            .with_seed(seed);

        match Engine::spawn(self.backend.clone(), params) {
            Ok(engine) => {
                *slot = Some(engine);
                StatusCode::Ok
            }
            Err(e) => {
                tracing::error!("init: {}", e);
                e.status()
            }
        }
    }

    /// Runs one completion and writes it, NUL-terminated, into `output`.
    ///
    /// `params_text` carries the sampling options (see
    /// [`GenerationConfig::from_params_text`]). On a non-zero status the
    /// contents of `output` are unspecified.
    pub fn generate(
        &self,
        prompt: Option<&str>,
        params_text: Option<&str>,
        output: Option<&mut [u8]>,
    ) -> StatusCode {
        let mut slot = self.lock();
        let Some(engine) = slot.as_ref() else {
            tracing::error!("generate: engine not initialized");
            return StatusCode::NotInitialized;
        };
        let Some(output) = output.filter(|o| o.len() > 1) else {
            tracing::error!("generate: invalid output buffer");
            return StatusCode::InvalidOutputBuffer;
        };

        let config = GenerationConfig::from_params_text(params_text);
        let policy = SamplingPolicy::for_config(&config);
        let byte_limit = output.len() - 1;

        match engine.generate(prompt.unwrap_or(""), &config, policy, Some(byte_limit)) {
            Ok(generation) => {
                write_bounded(&generation.text, output);
                StatusCode::Ok
            }
            Err(e @ EngineError::Worker(_)) => {
                // The worker is gone; free the slot so init can load again.
                tracing::error!("generate: {}, releasing engine", e);
                *slot = None;
                e.status()
            }
            Err(e) => {
                tracing::error!("generate: {}", e);
                e.status()
            }
        }
    }

    /// Releases the engine, if any. Always safe to call.
    pub fn dispose(&self) {
        let mut slot = self.lock();
        if let Some(engine) = slot.take() {
            // Joins the worker while the lock is still held.
            drop(engine);
            tracing::info!("dispose: freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bigram::corpus_file;
    use crate::backend::{BackendError, BigramBackend, Session, TokenId};

    const CORPUS: &str = "Hello there\n";

    fn bridge() -> Bridge<BigramBackend> {
        Bridge::new(BigramBackend)
    }

    fn path_of(file: &tempfile::NamedTempFile) -> String {
        file.path().to_string_lossy().into_owned()
    }

    fn c_text(buf: &[u8]) -> &[u8] {
        let end = buf.iter().position(|&b| b == 0).unwrap();
        &buf[..end]
    }

    #[test]
    fn test_end_to_end_greedy() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 2, 0), StatusCode::Ok);

        let mut buf = [0xAAu8; 32];
        let status = bridge.generate(
            Some("Hello"),
            Some(r#"{"max_tokens":3,"temperature":0.0}"#),
            Some(&mut buf),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(c_text(&buf), b" th");
    }

    #[test]
    fn test_init_twice_keeps_one_engine() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 0, 0), StatusCode::Ok);
        let first_id = bridge.lock().as_ref().unwrap().id();

        assert_eq!(bridge.init(None, -1, -1, -1, -1), StatusCode::Ok);
        assert_eq!(bridge.init(Some("/elsewhere.gguf"), 8, 0, 0, 0), StatusCode::Ok);
        assert_eq!(bridge.lock().as_ref().unwrap().id(), first_id);
    }

    #[test]
    fn test_init_invalid_path() {
        let bridge = bridge();
        assert_eq!(bridge.init(None, 0, 0, 0, 0), StatusCode::InvalidPath);
        assert_eq!(bridge.init(Some(""), 0, 0, 0, 0), StatusCode::InvalidPath);
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn test_init_failures_are_retryable() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(
            bridge.init(Some("/nonexistent/model.txt"), 64, 0, 0, 0),
            StatusCode::ModelLoadFailed
        );
        assert!(!bridge.is_initialized());
        assert_eq!(
            bridge.init(Some(path_of(&file).as_str()), 1_000_000, 0, 0, 0),
            StatusCode::SessionCreateFailed
        );
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 0, 0), StatusCode::Ok);
        assert!(bridge.is_initialized());
    }

    #[test]
    fn test_generate_requires_engine() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        let mut buf = [0u8; 16];
        assert_eq!(
            bridge.generate(Some("Hello"), None, Some(&mut buf)),
            StatusCode::NotInitialized
        );

        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 0, 0), StatusCode::Ok);
        bridge.dispose();
        assert_eq!(
            bridge.generate(Some("Hello"), None, Some(&mut buf)),
            StatusCode::NotInitialized
        );
    }

    #[test]
    fn test_generate_rejects_small_output() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        // Prompt longer than the context would fail evaluation if it ran.
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 4, 0, 0, 0), StatusCode::Ok);
        let long_prompt = "Hello Hello";

        assert_eq!(
            bridge.generate(Some(long_prompt), None, None),
            StatusCode::InvalidOutputBuffer
        );
        let mut one = [0u8; 1];
        assert_eq!(
            bridge.generate(Some(long_prompt), None, Some(&mut one)),
            StatusCode::InvalidOutputBuffer
        );
        let mut empty: [u8; 0] = [];
        assert_eq!(
            bridge.generate(Some(long_prompt), None, Some(&mut empty)),
            StatusCode::InvalidOutputBuffer
        );
    }

    #[test]
    fn test_zero_max_tokens() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 0, 0), StatusCode::Ok);
        let mut buf = [0xAAu8; 16];
        let status = bridge.generate(Some("Hello"), Some(r#"{"max_tokens":0}"#), Some(&mut buf));
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_prompt_eval_failure() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 4, 0, 0, 0), StatusCode::Ok);
        let mut buf = [0u8; 16];
        assert_eq!(
            bridge.generate(Some("Hello"), None, Some(&mut buf)),
            StatusCode::PromptEvalFailed
        );
    }

    #[test]
    fn test_step_failure_is_success() {
        let file = corpus_file(CORPUS);
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 8, 0, 0, 0), StatusCode::Ok);
        let mut buf = [0u8; 16];
        let status = bridge.generate(
            Some("Hello"),
            Some(r#"{"max_tokens":10,"temperature":0}"#),
            Some(&mut buf),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(c_text(&buf), b" th");
    }

    #[test]
    fn test_empty_and_missing_prompt() {
        let file = corpus_file("Hi\n");
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 64, 0, 0, 0), StatusCode::Ok);
        let mut buf = [0xAAu8; 16];
        let params = Some(r#"{"max_tokens":5,"temperature":0}"#);
        assert_eq!(bridge.generate(Some(""), params, Some(&mut buf)), StatusCode::Ok);
        assert_eq!(c_text(&buf), b"Hi");
        assert_eq!(bridge.generate(None, params, Some(&mut buf)), StatusCode::Ok);
        assert_eq!(c_text(&buf), b"Hi");
    }

    #[test]
    fn test_output_bounded_for_every_capacity() {
        let file = corpus_file(&format!("{}\n", "ab".repeat(200)));
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 32_768, 0, 0, 3), StatusCode::Ok);

        for params in [
            r#"{"max_tokens":100,"temperature":0}"#,
            r#"{"max_tokens":100,"temperature":0.8,"top_k":0,"repeat_penalty":1.0}"#,
        ] {
            for capacity in 2..48 {
                let mut buf = vec![0xAAu8; capacity];
                let status = bridge.generate(Some("a"), Some(params), Some(&mut buf));
                assert_eq!(status, StatusCode::Ok);
                let end = buf.iter().position(|&b| b == 0).unwrap();
                assert!(end <= capacity - 1);
            }
        }
    }

    #[test]
    fn test_greedy_fills_capacity_exactly() {
        let file = corpus_file(&format!("{}\n", "ab".repeat(200)));
        let bridge = bridge();
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 4096, 0, 0, 0), StatusCode::Ok);
        let mut buf = [0xAAu8; 6];
        let status = bridge.generate(
            Some("a"),
            Some(r#"{"max_tokens":100,"temperature":0}"#),
            Some(&mut buf),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(&buf, b"babab\0");
    }

    #[test]
    fn test_dispose_then_init_matches_fresh_run() {
        let file = corpus_file("abcabd\nabe\nacd\nbad\n");
        let params = Some(r#"{"max_tokens":16,"temperature":0.9,"repeat_penalty":1.3}"#);

        let fresh = bridge();
        assert_eq!(fresh.init(Some(path_of(&file).as_str()), 256, 0, 0, 11), StatusCode::Ok);
        let mut expected = [0u8; 64];
        assert_eq!(fresh.generate(Some("ab"), params, Some(&mut expected)), StatusCode::Ok);

        let reused = bridge();
        assert_eq!(reused.init(Some(path_of(&file).as_str()), 256, 0, 0, 11), StatusCode::Ok);
        let mut scratch = [0u8; 64];
        for _ in 0..3 {
            assert_eq!(reused.generate(Some("ab"), params, Some(&mut scratch)), StatusCode::Ok);
        }
        reused.dispose();
        assert!(!reused.is_initialized());
        assert_eq!(reused.init(Some(path_of(&file).as_str()), 256, 0, 0, 11), StatusCode::Ok);
        let mut actual = [0u8; 64];
        assert_eq!(reused.generate(Some("ab"), params, Some(&mut actual)), StatusCode::Ok);

        assert_eq!(c_text(&actual), c_text(&expected));
    }

    #[test]
    fn test_dispose_without_engine() {
        let bridge = bridge();
        bridge.dispose();
        bridge.dispose();
        assert!(!bridge.is_initialized());
    }

    /// Backend that panics on the worker at a chosen stage.
    #[derive(Clone, Copy)]
    enum Crashing {
        OnLoad,
        OnEvaluate,
    }

    struct CrashingSession;

    impl Backend for Crashing {
        type Model = ();
        type Session<'m> = CrashingSession;

        fn load_model(&self, _params: &InitParams) -> Result<(), BackendError> {
            match self {
                Crashing::OnLoad => panic!("loader crashed"),
                Crashing::OnEvaluate => Ok(()),
            }
        }

        fn create_session<'m>(
            &self,
            _model: &'m (),
            _params: &InitParams,
        ) -> Result<CrashingSession, BackendError> {
            Ok(CrashingSession)
        }
    }

    impl Session for CrashingSession {
        fn tokenize(&mut self, text: &str, _add_special: bool) -> Result<Vec<TokenId>, BackendError> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn evaluate(&mut self, _tokens: &[TokenId]) -> Result<(), BackendError> {
            panic!("evaluation crashed")
        }

        fn scores(&self) -> Vec<f32> {
            vec![0.0; 256]
        }

        fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
            Ok(vec![token as u8])
        }

        fn is_end_of_sequence(&self, _token: TokenId) -> bool {
            false
        }

        fn vocab_size(&self) -> usize {
            256
        }
    }

    #[test]
    fn test_loader_panic_reports_model_load_failed() {
        let bridge = Bridge::new(Crashing::OnLoad);
        assert_eq!(
            bridge.init(Some("/some/model.gguf"), 64, 0, 0, 0),
            StatusCode::ModelLoadFailed
        );
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn test_dead_worker_releases_engine() {
        let bridge = Bridge::new(Crashing::OnEvaluate);
        assert_eq!(bridge.init(Some("/some/model.gguf"), 64, 0, 0, 0), StatusCode::Ok);

        let mut buf = [0u8; 16];
        assert_eq!(
            bridge.generate(Some("Hello"), None, Some(&mut buf)),
            StatusCode::PromptEvalFailed
        );
        assert!(!bridge.is_initialized());
        assert_eq!(
            bridge.generate(Some("Hello"), None, Some(&mut buf)),
            StatusCode::NotInitialized
        );
        assert_eq!(bridge.init(Some("/some/model.gguf"), 64, 0, 0, 0), StatusCode::Ok);
        assert!(bridge.is_initialized());
    }

    #[test]
    fn test_concurrent_generate_calls_serialize() {
        let file = corpus_file(CORPUS);
        let bridge = std::sync::Arc::new(bridge());
        assert_eq!(bridge.init(Some(path_of(&file).as_str()), 4096, 0, 0, 0), StatusCode::Ok);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bridge = bridge.clone();
                std::thread::spawn(move || {
                    let mut buf = [0u8; 32];
                    let status = bridge.generate(
                        Some("Hello"),
                        Some(r#"{"max_tokens":3,"temperature":0}"#),
                        Some(&mut buf),
                    );
                    (status, buf)
                })
            })
            .collect();

        for handle in handles {
            let (status, buf) = handle.join().unwrap();
            assert_eq!(status, StatusCode::Ok);
            assert_eq!(c_text(&buf), b" th");
        }
    }
}
