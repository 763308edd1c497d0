//! Username newtype.

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

/// Maximum length of a username in bytes.
pub const MAX_USERNAME_LEN: usize = 256;

/// Validated username: 1 to 256 ASCII alphanumeric characters.
///
/// Implements `Borrow<str>` so maps keyed by `Username` can be queried
/// with the raw text received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

/// Reasons a string is not a valid username.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsernameError {
    #[error("username is empty")]
    Empty,

    #[error("username is {len} bytes long (max: {max})")]
    TooLong { len: usize, max: usize },

    #[error("username contains non-alphanumeric character {found:?}")]
    InvalidCharacter { found: char },
}

impl Username {
    /// Validates and wraps a username.
    pub fn parse(raw: &str) -> Result<Self, UsernameError> {
        if raw.is_empty() {
            return Err(UsernameError::Empty);
        }
        if raw.len() > MAX_USERNAME_LEN {
            return Err(UsernameError::TooLong {
                len: raw.len(),
                max: MAX_USERNAME_LEN,
            });
        }
        if let Some(found) = raw.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(UsernameError::InvalidCharacter { found });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Username {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_accepts_alphanumeric() {
        let name = Username::parse("alice42").unwrap();
        assert_eq!(name.as_str(), "alice42");
        assert_eq!(format!("{name}"), "alice42");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(Username::parse(""), Err(UsernameError::Empty));
    }

    #[test]
    fn test_parse_rejects_punctuation_and_spaces() {
        assert_eq!(
            Username::parse("bob smith"),
            Err(UsernameError::InvalidCharacter { found: ' ' })
        );
        assert_eq!(
            Username::parse("carol:"),
            Err(UsernameError::InvalidCharacter { found: ':' })
        );
    }

    #[test]
    fn test_parse_rejects_non_ascii_letters() {
        assert!(matches!(
            Username::parse("jos\u{e9}"),
            Err(UsernameError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn test_parse_length_limit() {
        let longest = "a".repeat(MAX_USERNAME_LEN);
        assert!(Username::parse(&longest).is_ok());

        let too_long = "a".repeat(MAX_USERNAME_LEN + 1);
        assert!(matches!(
            Username::parse(&too_long),
            Err(UsernameError::TooLong { .. })
        ));
    }

    #[test]
    fn test_map_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Username::parse("dave").unwrap(), 7);
        assert_eq!(map.get("dave"), Some(&7));
        assert_eq!(map.get("eve"), None);
    }
}
