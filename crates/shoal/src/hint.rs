//! Routing-hint parsing. A client may append one extra argument to any
//! command to steer routing:
//!
//! ```text
//! hash=<opaque>            route by <opaque>
//! hash=<opaque>,len=<n>    as above; <n> feeds distributed gets
//! index=<i>                route by the i'th existing argument
//! ```
//!
//! `<opaque>` excludes `,` and `=`. The hint is consumed before the command
//! is forwarded, so backends never see it.

use bytes::Bytes;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RoutingHint {
    Hash { key: Bytes, len: Option<usize> },
    Index(usize),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HintError {
    #[error("{0}")]
    BadInteger(#[from] std::num::ParseIntError),
    #[error("malformed routing hint [{0}]")]
    Malformed(String),
}

/// Inspects a command's last argument for a routing hint, in a single pass.
/// Returns `Ok(None)` when the argument is ordinary data.
pub(crate) fn parse(last: &[u8]) -> Result<Option<RoutingHint>, HintError> {
    if let Some(rest) = last.strip_prefix(b"hash=") {
        let mut key_end = rest.len();
        for (i, &b) in rest.iter().enumerate() {
            match b {
                b',' => {
                    key_end = i;
                    break;
                }
                b'=' => return Err(malformed(last)),
                _ => {}
            }
        }
        if key_end == 0 {
            return Err(malformed(last));
        }
        let len = if key_end < rest.len() {
            let tail = &rest[key_end + 1..];
            let digits = tail.strip_prefix(b"len=").ok_or_else(|| malformed(last))?;
            Some(digits_to_usize(digits, last)?)
        } else {
            None
        };
        return Ok(Some(RoutingHint::Hash {
            key: Bytes::copy_from_slice(&rest[..key_end]),
            len,
        }));
    }

    if let Some(digits) = last.strip_prefix(b"index=") {
        return Ok(Some(RoutingHint::Index(digits_to_usize(digits, last)?)));
    }

    Ok(None)
}

fn digits_to_usize(digits: &[u8], hint: &[u8]) -> Result<usize, HintError> {
    let text = std::str::from_utf8(digits).map_err(|_| malformed(hint))?;
    Ok(text.parse::<usize>()?)
}

fn malformed(hint: &[u8]) -> HintError {
    HintError::Malformed(String::from_utf8_lossy(hint).into_owned())
}
