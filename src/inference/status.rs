//! Status codes returned across the C boundary
//!
//! The numeric values are part of the bridge's ABI and must not change.

/// Outcome of a bridge operation
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok = 0,
    ModelLoadFailed = -1,
    SessionCreateFailed = -2,
    InvalidPath = -3,
    NotInitialized = -10,
    PromptEvalFailed = -20,
    InvalidOutputBuffer = -30,
}

impl StatusCode {
    /// The stable integer value
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}
