//! Validated entity name.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const MAX_NAME_LEN: usize = 512;

/// Name of an author or a book.
///
/// Accepts 1..=512 characters of ASCII alphanumeric words separated by
/// single spaces (no leading/trailing spaces, no runs of spaces).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityName(String);

impl EntityName {
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "name exceeds {MAX_NAME_LEN} characters"
            )));
        }

        let mut prev_space = true;
        for ch in raw.chars() {
            if ch == ' ' {
                if prev_space {
                    return Err(DomainError::validation(
                        "name must be alphanumeric words separated by single spaces",
                    ));
                }
                prev_space = true;
            } else if ch.is_ascii_alphanumeric() {
                prev_space = false;
            } else {
                return Err(DomainError::validation(format!(
                    "name contains forbidden character {ch:?}"
                )));
            }
        }
        if prev_space {
            // Ends with a space (or the loop never cleared the flag).
            return Err(DomainError::validation(
                "name must not end with a space",
            ));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EntityName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_single_word() {
        assert_eq!(EntityName::parse("Ada").unwrap().as_str(), "Ada");
    }

    #[test]
    fn accepts_spaced_words() {
        assert!(EntityName::parse("Ada Lovelace 1815").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(EntityName::parse("").is_err());
    }

    #[test]
    fn rejects_leading_and_trailing_space() {
        assert!(EntityName::parse(" Ada").is_err());
        assert!(EntityName::parse("Ada ").is_err());
    }

    #[test]
    fn rejects_double_space() {
        assert!(EntityName::parse("Ada  Lovelace").is_err());
    }

    #[test]
    fn rejects_punctuation() {
        assert!(EntityName::parse("Ada-Lovelace").is_err());
        assert!(EntityName::parse("Ada_Lovelace").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let raw = "a".repeat(513);
        assert!(EntityName::parse(raw).is_err());
        let raw = "a".repeat(512);
        assert!(EntityName::parse(raw).is_ok());
    }
}
