//! Channel identity.
//!
//! A channel is a non-empty string identifying a logical event topic within
//! a namespace prefix. Channels have no lifecycle of their own: they come
//! into existence implicitly the first time something is published or
//! subscribed on them.

use std::fmt;

/// A non-empty, namespaced topic identifier.
///
/// Identity is `prefix || name` — two channels built from the same prefix
/// and name compare equal regardless of how they were constructed.
///
/// # Examples
///
/// ```
/// use pubsub_core::channel::Channel;
///
/// let a = Channel::new("orders", "order-42");
/// let b = Channel::from_qualified("orders:order-42");
/// assert_eq!(a.as_str(), "orders:order-42");
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Channel(String);

/// Separator used to join a channel's prefix and name.
pub const PREFIX_SEPARATOR: char = ':';

impl Channel {
    /// Builds a channel from a namespace prefix and a bare name.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    #[must_use]
    pub fn new(prefix: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        assert!(!name.is_empty(), "channel name must not be empty");
        let prefix = prefix.as_ref();
        if prefix.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{prefix}{PREFIX_SEPARATOR}{name}"))
        }
    }

    /// Wraps an already-qualified channel string verbatim.
    ///
    /// # Panics
    ///
    /// Panics if `qualified` is empty.
    #[must_use]
    pub fn from_qualified(qualified: impl Into<String>) -> Self {
        let qualified = qualified.into();
        assert!(!qualified.is_empty(), "channel identity must not be empty");
        Self(qualified)
    }

    /// Returns the fully-qualified channel string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the channel, returning the fully-qualified string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Self::from_qualified(value)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::from_qualified(value.to_string())
    }
}
