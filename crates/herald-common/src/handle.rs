//! Handle parsing — `local-part@domain` addressing.
//!
//! A handle names an identity anywhere in the federation, the same way an
//! email address does. Parsing is pure: no lookups, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HeraldError;

/// A parsed `local-part@domain` handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub local_part: String,
    pub domain: String,
}

impl Handle {
    /// Whether this handle is hosted on `domain` (i.e. local to that node).
    pub fn is_local_to(&self, domain: &str) -> bool {
        self.domain == domain
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// Split a raw handle string into its local part and domain.
///
/// Splits on the *first* `@` — the local part never contains one, and domains
/// cannot. Fails with [`HeraldError::MalformedHandle`] when the separator is
/// missing or either side is empty.
pub fn parse_handle(raw: &str) -> Result<Handle, HeraldError> {
    let (local_part, domain) = raw
        .split_once('@')
        .ok_or_else(|| HeraldError::MalformedHandle(raw.to_owned()))?;

    if local_part.is_empty() || domain.is_empty() {
        return Err(HeraldError::MalformedHandle(raw.to_owned()));
    }

    Ok(Handle { local_part: local_part.to_owned(), domain: domain.to_owned() })
}
