//! C ABI
//!
//! The exported symbols a host application links against. All of them share
//! one process-wide [`Bridge`], so init, generate and dispose never run
//! concurrently. Outcomes are reported only through return values; panics
//! are caught and never cross the boundary.
//!
//! See `include/llm_bridge.h` for the matching declarations.

use std::borrow::Cow;
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};

use once_cell::sync::Lazy;

use crate::bridge::Bridge;
use crate::inference::StatusCode;
use crate::logging;

#[cfg(feature = "llama")]
type DefaultBackend = crate::backend::LlamaCppBackend;
#[cfg(not(feature = "llama"))]
type DefaultBackend = crate::backend::BigramBackend;

static BRIDGE: Lazy<Bridge<DefaultBackend>> = Lazy::new(|| Bridge::new(DefaultBackend::default()));

static ALIVE: &[u8] = b"llama bridge OK\0";

/// Borrows a NUL-terminated string, `None` for null.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for `'a`.
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr))
    }
}

/// Loads a model and opens its session. Returns 0 on success.
///
/// A second call while a model is loaded succeeds without doing anything.
///
/// # Safety
/// `model_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llm_init(
    model_path: *const c_char,
    n_ctx: c_int,
    n_gpu_layers: c_int,
    n_threads: c_int,
    seed: c_int,
) -> c_int {
    logging::init();
    // A path that is not UTF-8 is treated like a missing one.
    let path = c_str(model_path).and_then(|p| p.to_str().ok());
    catch_unwind(AssertUnwindSafe(|| {
        BRIDGE.init(path, n_ctx, n_gpu_layers, n_threads, seed)
    }))
    .unwrap_or(StatusCode::ModelLoadFailed)
    .code()
}

/// Generates a completion of `prompt` into `out_buf`. Returns 0 on success.
///
/// `params_json` may hold the keys temperature, top_p, top_k,
/// repeat_penalty and max_tokens. The output is UTF-8 (possibly cut inside
/// a character), NUL-terminated, and at most `out_buf_size - 1` bytes long.
///
/// # Safety
/// `prompt` and `params_json` must be null or valid NUL-terminated strings.
/// `out_buf` must be null or valid for writes of `out_buf_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn llm_infer(
    prompt: *const c_char,
    params_json: *const c_char,
    out_buf: *mut c_char,
    out_buf_size: c_int,
) -> c_int {
    logging::init();
    let prompt: Option<Cow<'_, str>> = c_str(prompt).map(CStr::to_string_lossy);
    let params: Option<Cow<'_, str>> = c_str(params_json).map(CStr::to_string_lossy);
    let output = match usize::try_from(out_buf_size) {
        Ok(len) if !out_buf.is_null() && len > 0 => {
            Some(std::slice::from_raw_parts_mut(out_buf.cast::<u8>(), len))
        }
        _ => None,
    };

    catch_unwind(AssertUnwindSafe(|| {
        BRIDGE.generate(prompt.as_deref(), params.as_deref(), output)
    }))
    .unwrap_or(StatusCode::PromptEvalFailed)
    .code()
}

/// Releases the loaded model, if any.
#[no_mangle]
pub extern "C" fn llm_dispose() {
    logging::init();
    if catch_unwind(AssertUnwindSafe(|| BRIDGE.dispose())).is_err() {
        tracing::error!("dispose: panicked");
    }
}

/// Liveness probe; returns a static string.
#[no_mangle]
pub extern "C" fn llm_is_alive() -> *const c_char {
    logging::init();
    ALIVE.as_ptr().cast()
}
