//! Shared immutable strings.

use std::fmt::Display;

#[derive(Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
/// A thread-safe reference-counted string type.
///
/// Header values and transaction keys are shared between tasks; cloning an
/// `ArcStr` only bumps a reference count.
pub struct ArcStr(std::sync::Arc<str>);

impl ArcStr {
    /// Builds an `ArcStr` with every ASCII letter lowercased.
    ///
    /// Used by transaction keys, which compare case-insensitively.
    pub fn from_lowercase(s: &str) -> Self {
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(std::sync::Arc::from(s.to_ascii_lowercase()))
        } else {
            Self(std::sync::Arc::from(s))
        }
    }

    /// Returns the string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for ArcStr {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ArcStr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ArcStr {
    fn eq(&self, other: &str) -> bool {
        &self[..] == other
    }
}

impl PartialEq<&str> for ArcStr {
    fn eq(&self, other: &&str) -> bool {
        &self[..] == *other
    }
}

impl Display for ArcStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for ArcStr {
    fn from(s: &str) -> Self {
        Self(std::sync::Arc::from(s))
    }
}

impl From<String> for ArcStr {
    fn from(s: String) -> Self {
        Self(std::sync::Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lowercase() {
        let s = ArcStr::from_lowercase("z9hG4bKnashds7");
        assert_eq!(s, "z9hg4bknashds7");
        assert_eq!(ArcStr::from_lowercase("already-lower"), "already-lower");
    }
}
