//! Bounded output
//!
//! Copies generated bytes into a caller-owned, fixed-capacity buffer.

/// Copies at most `target.len() - 1` bytes of `text` into `target` and
/// NUL-terminates right after them.
///
/// Truncation happens on a byte boundary, so a multi-byte UTF-8 character
/// may be cut. Returns the number of content bytes written; an empty target
/// is left untouched.
pub fn write_bounded(text: &[u8], target: &mut [u8]) -> usize {
    let Some(max_content) = target.len().checked_sub(1) else {
        return 0;
    };
    let n = text.len().min(max_content);
    target[..n].copy_from_slice(&text[..n]);
    target[n] = 0;
    n
}
