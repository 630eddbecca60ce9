//! Reversible text form of source paths.
//!
//! Manifest keys are UTF-8 while Unix file names are arbitrary bytes. A key
//! keeps every valid UTF-8 character of a name except `%` and `\`; those two
//! and every byte outside valid UTF-8 are written as `%XX`.

use crate::{Error, Result};
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt::Write;
use std::path::{Component, Path};

/// `/`-separated manifest key of a path relative to the source root.
pub fn encode_relative(relative: &Path) -> Result<String> {
    let mut key = String::new();
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return Err(Error::Other(format!(
                "{} is not a plain relative path",
                relative.display()
            )));
        };
        if !key.is_empty() {
            key.push('/');
        }
        escape_into(&os_bytes(name), &mut key);
    }
    Ok(key)
}

/// Decodes one `/`-free segment of a manifest key back to the file name it
/// was built from.
pub fn decode_component(part: &str) -> Result<OsString> {
    let bytes = part.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let byte = part
                .get(i + 1..i + 3)
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| Error::Corruption(format!("Malformed escape in entry path {}", part)))?;
            decoded.push(byte);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    os_from_bytes(decoded)
}

/// Whether `name` can be joined onto a restore root as exactly one component.
pub fn is_plain_name(name: &OsStr) -> bool {
    let bytes = os_bytes(name);
    let separator = |b: &u8| *b == b'/' || (cfg!(not(unix)) && *b == b'\\');
    !bytes.is_empty() && name != "." && name != ".." && !bytes.iter().any(separator)
}

fn escape_into(bytes: &[u8], key: &mut String) {
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '%' | '\\' => {
                    let _ = write!(key, "%{:02X}", c as u32);
                }
                c => key.push(c),
            }
        }
        for byte in chunk.invalid() {
            let _ = write!(key, "%{:02X}", byte);
        }
    }
}

/// Raw bytes of an OS string.
#[cfg(unix)]
pub fn os_bytes(value: &OsStr) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(value.as_bytes())
}

#[cfg(not(unix))]
pub fn os_bytes(value: &OsStr) -> Cow<'_, [u8]> {
    match value.to_string_lossy() {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}

#[cfg(unix)]
pub fn os_from_bytes(bytes: Vec<u8>) -> Result<OsString> {
    use std::os::unix::ffi::OsStringExt;
    Ok(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
pub fn os_from_bytes(bytes: Vec<u8>) -> Result<OsString> {
    String::from_utf8(bytes)
        .map(OsString::from)
        .map_err(|e| Error::Corruption(format!("Name is not valid on this platform: {}", e)))
}
