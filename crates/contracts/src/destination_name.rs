//! DestinationName - case-insensitive destination identifier
//!
//! Uses Arc<str> internally for O(1) clone operations. The stored form is
//! trimmed and lower-cased, so `"GA"`, `" ga "` and `"ga"` are one key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Destination identifier with cheap cloning.
///
/// Registry keys, alias keys and dispatch inputs all pass through this
/// type, which keeps lookups independent of the caller's casing.
///
/// # Examples
/// ```
/// use contracts::DestinationName;
///
/// let name: DestinationName = "Google_Analytics".into();
/// assert_eq!(name, "google_analytics");
/// assert_eq!(name.upper(), "GOOGLE_ANALYTICS");
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationName(Arc<str>);

impl DestinationName {
    /// Create a normalized name.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(Arc::from(trimmed.to_ascii_lowercase()))
        } else {
            Self(Arc::from(trimmed))
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upper-cased form used in metric tags
    pub fn upper(&self) -> String {
        self.0.to_ascii_uppercase()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for DestinationName {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for DestinationName {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Only sound because the stored form is already normalized: a `&str` lookup
// must be normalized by the caller first.
impl Borrow<str> for DestinationName {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DestinationName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DestinationName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<&String> for DestinationName {
    fn from(s: &String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestinationName({:?})", self.0)
    }
}

impl PartialEq<str> for DestinationName {
    fn eq(&self, other: &str) -> bool {
        self.0.as_ref() == other
    }
}

impl PartialEq<&str> for DestinationName {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == *other
    }
}

impl Serialize for DestinationName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DestinationName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(&s))
    }
}
