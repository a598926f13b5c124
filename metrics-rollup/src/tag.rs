use std::{fmt, str::FromStr};

use metrics::{Label, SharedString};
use thiserror::Error;

/// Sentinel value substituted for a masked rollup dimension.
pub const GLOBAL_TOKEN: &str = "global";

/// A single `key:value` annotation attached to a metric emission.
///
/// Keys are case-sensitive. A key is expected to appear at most once per tag set, but this is not
/// validated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    key: SharedString,
    value: SharedString,
}

impl Tag {
    /// Creates a new `Tag` from a key and value.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        Tag { key: key.into(), value: value.into() }
    }

    /// Creates a new `Tag` from static strings.
    ///
    /// This can be used in const contexts, such as static tag tables.
    pub const fn from_static_parts(key: &'static str, value: &'static str) -> Self {
        Tag { key: SharedString::const_str(key), value: SharedString::const_str(value) }
    }

    /// Key of this tag.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value of this tag.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns a copy of this tag with the value replaced by [`GLOBAL_TOKEN`].
    pub fn masked(&self) -> Tag {
        Tag { key: self.key.clone(), value: SharedString::const_str(GLOBAL_TOKEN) }
    }

    /// Returns `true` if the value of this tag is [`GLOBAL_TOKEN`].
    pub fn is_global(&self) -> bool {
        self.value() == GLOBAL_TOKEN
    }

    /// Consumes this tag, returning the key and value.
    pub fn into_parts(self) -> (SharedString, SharedString) {
        (self.key, self.value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key(), self.value())
    }
}

/// Error returned when parsing a tag without a `key:value` separator.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("tag '{input}' is missing a ':' separator")]
pub struct ParseTagError {
    input: String,
}

impl FromStr for Tag {
    type Err = ParseTagError;

    /// Parses `key:value`, splitting on the first `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) => Ok(Tag::new(key.to_owned(), value.to_owned())),
            None => Err(ParseTagError { input: s.to_owned() }),
        }
    }
}

impl<K, V> From<(K, V)> for Tag
where
    K: Into<SharedString>,
    V: Into<SharedString>,
{
    fn from((key, value): (K, V)) -> Self {
        Tag::new(key, value)
    }
}

impl From<Tag> for Label {
    fn from(tag: Tag) -> Self {
        let (key, value) = tag.into_parts();
        Label::new(key, value)
    }
}

impl From<&Tag> for Label {
    fn from(tag: &Tag) -> Self {
        Label::new(tag.key.clone(), tag.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{Tag, GLOBAL_TOKEN};
    use metrics::Label;

    #[test]
    fn display_uses_colon_separator() {
        let tag = Tag::new("region", "us-west-2");
        assert_eq!(tag.to_string(), "region:us-west-2");
    }

    #[test]
    fn parse_splits_on_first_colon() {
        let tag: Tag = "url:http://localhost".parse().unwrap();
        assert_eq!(tag.key(), "url");
        assert_eq!(tag.value(), "http://localhost");

        let empty: Tag = "key:".parse().unwrap();
        assert_eq!(empty.value(), "");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        let err = "hostname".parse::<Tag>().unwrap_err();
        assert_eq!(err.to_string(), "tag 'hostname' is missing a ':' separator");
    }

    #[test]
    fn masked_keeps_key() {
        static HOST: Tag = Tag::from_static_parts("host", "i-1234");
        let masked = HOST.masked();
        assert_eq!(masked.key(), "host");
        assert_eq!(masked.value(), GLOBAL_TOKEN);
        assert!(masked.is_global());
        assert!(!HOST.is_global());
    }

    #[test]
    fn converts_into_label() {
        let label: Label = Tag::new("az", "a").into();
        assert_eq!(label.key(), "az");
        assert_eq!(label.value(), "a");
    }
}
