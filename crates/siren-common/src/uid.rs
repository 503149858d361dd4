//! User identifiers of the form `local-part@domain`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A parsed user identifier.
///
/// Surrounding whitespace is trimmed on parse; the identifier must contain
/// exactly one `@` with non-empty parts on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    local: String,
    domain: String,
}

/// Error returned when a user identifier fails to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidError {
    /// The identifier did not contain exactly one `@`.
    #[error("user identifier must contain exactly one '@'")]
    MissingSeparator,
    /// The local part or the domain was empty.
    #[error("user identifier has an empty local part or domain")]
    EmptyPart,
}

impl Uid {
    /// The part before the `@`.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain the identifier is authoritative under.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl FromStr for Uid {
    type Err = UidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut parts = trimmed.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => {
                if local.is_empty() || domain.is_empty() {
                    Err(UidError::EmptyPart)
                } else {
                    Ok(Self {
                        local: local.to_owned(),
                        domain: domain.to_owned(),
                    })
                }
            }
            _ => Err(UidError::MissingSeparator),
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}
