//! Tag-name grammar.
//!
//! The empty string is a valid tag meaning "published" and is handled by
//! callers before reaching here; this module validates non-empty tag names.

use crate::Error;

pub const TAG_MAX_LEN: usize = 128;

/// Validate a non-empty tag name: <=128 chars, ASCII `[A-Za-z0-9_.-]`, first
/// character not `.` or `-`.
pub fn validate_tag_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > TAG_MAX_LEN {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    if !name.is_ascii() {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
    {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    let first = name.as_bytes()[0];
    if first == b'.' || first == b'-' {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    Ok(())
}
