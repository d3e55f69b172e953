use crate::{Topic, TopicBuf};
use std::{borrow, fmt, ops};
use thiserror::Error;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// A subscription topic filter.
///
/// A filter is a topic pattern in which `+` matches exactly one level and a
/// trailing `#` matches any number of remaining levels. This is the borrowed
/// form; see [`FilterBuf`] for the owned variant.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter(str);

/// An owned subscription topic filter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterBuf(String);

#[derive(Clone, Debug, Error)]
pub enum InvalidFilter {
	#[error("filter cannot be empty")]
	Empty,
	#[error("filter cannot exceed the maximum length of an MQTT string (65,535 bytes)")]
	TooLong,
	#[error("filter levels cannot mix wildcard and non-wildcard characters")]
	MixedLevel,
	#[error("multi-level wildcard may only appear once, as the final level")]
	MisplacedMultiLevelWildcard,
}

impl Filter {
	pub fn new<S: AsRef<str> + ?Sized>(filter: &S) -> Result<&Filter, InvalidFilter> {
		let filter = filter.as_ref();

		if filter.is_empty() {
			return Err(InvalidFilter::Empty);
		}

		if filter.len() > u16::MAX as usize {
			return Err(InvalidFilter::TooLong);
		}

		let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
		while let Some(level) = levels.next() {
			if level.len() > 1 && level.contains(['+', '#']) {
				return Err(InvalidFilter::MixedLevel);
			}
			if level == MULTI_LEVEL_WILDCARD && levels.peek().is_some() {
				return Err(InvalidFilter::MisplacedMultiLevelWildcard);
			}
		}

		Ok(Self::from_str(filter))
	}

	/// Determines whether `topic` would be matched by this filter.
	pub fn matches_topic(&self, topic: &Topic) -> bool {
		let mut topic_levels = topic.levels();

		for filter_level in self.levels() {
			match filter_level {
				MULTI_LEVEL_WILDCARD => {
					// Matches the parent level and everything below it, but
					// must cover at least one topic level.
					return topic_levels.next().is_some();
				}
				SINGLE_LEVEL_WILDCARD => {
					if topic_levels.next().is_none() {
						return false;
					}
				}
				exact => {
					if topic_levels.next() != Some(exact) {
						return false;
					}
				}
			}
		}

		topic_levels.next().is_none()
	}

	/// Length of the filter in bytes when encoded as UTF-8.
	#[inline]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Valid filters are never empty, so this is always `false`.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	#[inline]
	pub fn to_filter_buf(&self) -> FilterBuf {
		FilterBuf(String::from(&self.0))
	}

	/// Iterates over the `/`-separated levels of the filter.
	#[inline]
	pub fn levels(&self) -> impl Iterator<Item = &str> {
		self.0.split(LEVEL_SEPARATOR)
	}

	/// Wraps a `&'static str` without validating it.
	#[inline]
	pub const fn from_static(filter: &'static str) -> &'static Filter {
		unsafe { &*(filter as *const str as *const Filter) }
	}

	const fn from_str(s: &str) -> &Self {
		// Filter is a repr-transparent wrapper around str.
		unsafe { &*(s as *const str as *const Filter) }
	}
}

impl FilterBuf {
	#[inline]
	pub fn new(filter: impl Into<String>) -> Result<Self, InvalidFilter> {
		let filter = filter.into();
		Filter::new(&filter)?;
		Ok(Self(filter))
	}

	#[inline]
	pub fn into_inner(self) -> String {
		self.0
	}
}

impl AsRef<str> for Filter {
	#[inline]
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl AsRef<Filter> for Filter {
	#[inline]
	fn as_ref(&self) -> &Filter {
		self
	}
}

impl ToOwned for Filter {
	type Owned = FilterBuf;
	#[inline]
	fn to_owned(&self) -> Self::Owned {
		self.to_filter_buf()
	}
}

// Any valid topic is also a valid filter.
impl<'t> From<&'t Topic> for &'t Filter {
	fn from(value: &'t Topic) -> &'t Filter {
		Filter::from_str(value.as_str())
	}
}

impl From<TopicBuf> for FilterBuf {
	#[inline]
	fn from(value: TopicBuf) -> Self {
		let filter: &Filter = value.as_ref().into();
		filter.to_filter_buf()
	}
}

impl<'f> TryFrom<&'f str> for &'f Filter {
	type Error = InvalidFilter;
	fn try_from(value: &'f str) -> Result<Self, Self::Error> {
		Filter::new(value)
	}
}

impl ops::Deref for FilterBuf {
	type Target = Filter;
	#[inline]
	fn deref(&self) -> &Self::Target {
		Filter::from_str(&self.0)
	}
}

impl borrow::Borrow<Filter> for FilterBuf {
	#[inline]
	fn borrow(&self) -> &Filter {
		self
	}
}

impl From<&Filter> for FilterBuf {
	#[inline]
	fn from(value: &Filter) -> Self {
		value.to_filter_buf()
	}
}

impl AsRef<Filter> for FilterBuf {
	#[inline]
	fn as_ref(&self) -> &Filter {
		self
	}
}

impl TryFrom<&str> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<String> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl fmt::Display for Filter {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl fmt::Display for FilterBuf {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[cfg(test)]
mod tests {
	use super::Filter;
	use crate::Topic;

	#[test]
	fn validates_filters() {
		for filter in [
			"a", "+", "#", "/", "a/", "/b", "a/b", "+/b", "a/+", "+/+", "+/#", "/#", "a/b/c/#",
		] {
			Filter::new(filter).unwrap();
		}

		for filter in ["", "a/b+", "a/+b", "a/b#", "a/#b", "a/#/c", "#/"] {
			assert!(Filter::new(filter).is_err());
		}
	}

	#[test]
	fn matches_topics() {
		let matches = |filter: &str, topic: &str| {
			Filter::new(filter)
				.unwrap()
				.matches_topic(Topic::new(topic).unwrap())
		};

		assert!(matches("a/b", "a/b"));
		assert!(!matches("a/b", "a"));
		assert!(!matches("a/b", "a/b/c"));

		assert!(matches("a/+", "a/b"));
		assert!(!matches("a/+", "a"));
		assert!(!matches("a/+", "a/b/c"));
		assert!(matches("+/+", "/b"));

		assert!(matches("a/b/#", "a/b/c"));
		assert!(matches("a/b/#", "a/b/c/d"));
		assert!(!matches("a/b/#", "a/b"));
		assert!(matches("#", "a"));
		assert!(matches("#", "a/b/c"));
	}
}
