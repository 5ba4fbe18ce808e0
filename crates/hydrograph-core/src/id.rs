//! Field identifiers: [`Key`], [`Tag`], and the [`KeyTag`] pair.

use std::borrow::{Borrow, Cow};
use std::fmt;

/// Names a physical quantity, e.g. `"pressure"` or `"surface-ponded_depth"`.
///
/// Keys may carry a domain prefix separated by `-`; see
/// [`keys::get_domain`](crate::keys::get_domain).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Create a key from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pair this key with a tag.
    pub fn at(&self, tag: &Tag) -> KeyTag {
        KeyTag::new(self.clone(), tag.clone())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl From<&String> for Key {
    fn from(v: &String) -> Self {
        Self(v.clone())
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Key {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Key {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A point in (pseudo-)time at which a parallel set of field values exists.
///
/// The integrator works with two tags: [`Tag::previous`] holds the last
/// accepted state, [`Tag::next`] the trial state of the step in progress.
/// Additional tags are free-form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(Cow<'static, str>);

impl Tag {
    /// The last accepted (committed) state.
    pub const PREVIOUS: Tag = Tag(Cow::Borrowed("previous"));
    /// The trial state of the step in progress.
    pub const NEXT: Tag = Tag(Cow::Borrowed("next"));

    /// Create a tag from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The `"previous"` tag.
    pub fn previous() -> Self {
        Self::PREVIOUS
    }

    /// The `"next"` tag.
    pub fn next() -> Self {
        Self::NEXT
    }

    /// The tag name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

/// A `(key, tag)` pair identifying one field record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyTag {
    /// The physical quantity.
    pub key: Key,
    /// The time level.
    pub tag: Tag,
}

impl KeyTag {
    /// Pair a key with a tag.
    pub fn new(key: impl Into<Key>, tag: Tag) -> Self {
        Self {
            key: key.into(),
            tag,
        }
    }
}

impl fmt::Display for KeyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.tag)
    }
}

/// Monotonically increasing record version.
///
/// Bumped every time a record's data changes. Version `0` means the
/// record has never been written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u64);

impl Version {
    /// The successor version.
    pub fn bumped(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_tag_display() {
        let kt = Key::from("pressure").at(&Tag::NEXT);
        assert_eq!(kt.to_string(), "pressure@next");
    }

    #[test]
    fn const_and_owned_tags_compare_equal() {
        assert_eq!(Tag::new("previous"), Tag::PREVIOUS);
        assert_ne!(Tag::NEXT, Tag::PREVIOUS);
    }

    #[test]
    fn version_bumps_monotonically() {
        let v = Version::default();
        assert!(v.bumped() > v);
        assert_eq!(v.bumped().bumped(), Version(2));
    }
}
