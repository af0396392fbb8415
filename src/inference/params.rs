//! Per-call generation parameters
//!
//! Callers pass sampling options as a loosely structured text blob (normally
//! a JSON object). Resolution is lenient: anything missing or unreadable
//! falls back to its default and no error is ever reported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sampling temperature used when none is given
pub const DEFAULT_TEMPERATURE: f32 = 0.4;
/// Nucleus threshold used when none is given
pub const DEFAULT_TOP_P: f32 = 0.9;
/// Top-k cutoff used when none is given
pub const DEFAULT_TOP_K: i32 = 40;
/// Repetition penalty used when none is given
pub const DEFAULT_REPEAT_PENALTY: f32 = 1.1;
/// Token budget used when none is given
pub const DEFAULT_MAX_TOKENS: i32 = 128;

/// Sampling configuration for one generate call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Temperature for sampling (<= 0 selects greedy decoding)
    pub temperature: f32,
    /// Top-p (nucleus) sampling threshold (>= 1 disables it)
    pub top_p: f32,
    /// Top-k cutoff (<= 0 disables it)
    pub top_k: i32,
    /// Repetition penalty (1.0 disables it)
    pub repeat_penalty: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: i32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            repeat_penalty: DEFAULT_REPEAT_PENALTY,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl GenerationConfig {
    /// Resolves a configuration from caller-supplied text.
    ///
    /// Text that parses as a JSON object is read field by field; recognized
    /// top-level keys with numeric values override the defaults. Anything
    /// else is scanned with [`extract`], which tolerates truncated or
    /// hand-written blobs.
    pub fn from_params_text(text: Option<&str>) -> Self {
        let Some(text) = text else {
            return Self::default();
        };
        match serde_json::from_str::<Map<String, Value>>(text) {
            Ok(object) => Self::from_json_object(&object),
            Err(e) => {
                tracing::debug!("Params are not a JSON object ({e}), scanning for keys");
                Self::from_scan(text)
            }
        }
    }

    fn from_json_object(object: &Map<String, Value>) -> Self {
        let number = |key: &str, default: f64| {
            object.get(key).and_then(Value::as_f64).unwrap_or(default)
        };
        Self {
            temperature: number("temperature", DEFAULT_TEMPERATURE as f64) as f32,
            top_p: number("top_p", DEFAULT_TOP_P as f64) as f32,
            top_k: number("top_k", DEFAULT_TOP_K as f64) as i32,
            repeat_penalty: number("repeat_penalty", DEFAULT_REPEAT_PENALTY as f64) as f32,
            max_tokens: number("max_tokens", DEFAULT_MAX_TOKENS as f64) as i32,
        }
    }

    fn from_scan(text: &str) -> Self {
        let text = Some(text);
        Self {
            temperature: extract(text, "temperature", DEFAULT_TEMPERATURE as f64) as f32,
            top_p: extract(text, "top_p", DEFAULT_TOP_P as f64) as f32,
            top_k: extract_int(text, "top_k", DEFAULT_TOP_K),
            repeat_penalty: extract(text, "repeat_penalty", DEFAULT_REPEAT_PENALTY as f64) as f32,
            max_tokens: extract_int(text, "max_tokens", DEFAULT_MAX_TOKENS),
        }
    }

    /// Token budget as a loop bound (negative budgets generate nothing).
    pub fn token_budget(&self) -> usize {
        usize::try_from(self.max_tokens).unwrap_or(0)
    }
}

/// Reads the number following `key` in `text`, or returns `default`.
///
/// Finds the first occurrence of `key` anywhere in the text, then the first
/// `:` after it, and parses the numeric literal after that colon. This is a
/// plain substring scan: a key that appears inside another key or inside a
/// string value matches too, so `"foo_top_k":5` yields 5 for `top_k`.
pub fn extract(text: Option<&str>, key: &str, default: f64) -> f64 {
    let Some(text) = text else {
        return default;
    };
    let Some(key_at) = text.find(key) else {
        return default;
    };
    let after_key = &text[key_at + key.len()..];
    let Some(colon_at) = after_key.find(':') else {
        return default;
    };
    parse_leading_number(&after_key[colon_at + 1..]).unwrap_or(default)
}

/// [`extract`] for integer options; fractional values truncate toward zero.
pub fn extract_int(text: Option<&str>, key: &str, default: i32) -> i32 {
    extract(text, key, default as f64) as i32
}

/// Parses the longest decimal literal at the start of `s`, after whitespace.
fn parse_leading_number(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - (end + 1);
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    s[..end].parse().ok()
}
