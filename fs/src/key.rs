//! Entity key ⇄ file name mapping.
//!
//! ASCII letters, digits, `-` and `_` pass through; every other byte is
//! written as `%XX`. The mapping is reversible, and no key can produce a
//! path separator, `.` or `..`.

use std::fmt::Write;

const EXTENSION: &str = ".json";

/// File name holding `key`'s state.
pub(crate) fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + EXTENSION.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "%{byte:02X}");
        }
    }
    name.push_str(EXTENSION);
    name
}

/// Entity key stored in `name`, or `None` for files this backend did not
/// write.
///
/// Only the canonical spelling is accepted: `name` must be exactly what
/// [`file_name`] produces for the decoded key, so each key maps to one file.
pub(crate) fn key_of(name: &str) -> Option<String> {
    let encoded = name.strip_suffix(EXTENSION)?;
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded.as_bytes();

    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let hex = tail.get(..2)?;
            let hex = std::str::from_utf8(hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    let key = String::from_utf8(bytes).ok()?;
    (file_name(&key) == name).then_some(key)
}
