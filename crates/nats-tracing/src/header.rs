// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-value header maps shared by the bus and the propagation layer.
//!
//! Two flavours of the same map exist:
//! - [`Headers`]: the metadata attached to a bus [`Message`](crate::bus::Message).
//!   Keys are kept verbatim (bus headers are case-sensitive).
//! - [`HeaderCarrier`]: the carrier handed to a [`TextMapPropagator`](opentelemetry::propagation::TextMapPropagator).
//!   It implements [`Injector`] and [`Extractor`] with case-insensitive lookups.
//!
//! # Nil versus empty
//!
//! A key may be present with no value list at all (`None`) or with an empty
//! value list (`Some` of zero values). Both survive conversion unchanged.
//!
//! # Conversion
//!
//! [`Headers::to_carrier`] and [`HeaderCarrier::to_native`] copy every value
//! into one freshly allocated buffer sized to the total value count, and give
//! each key a [`HeaderValues`] view into that buffer. The source is never
//! aliased: views are read-only and detach on the first mutation.

use std::collections::{hash_map, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, Range};
use std::sync::Arc;

use opentelemetry::propagation::{Extractor, Injector};

/// Ordered values of one header key.
///
/// A view into a possibly shared, immutable backing buffer. Mutating methods
/// copy the viewed values into a buffer of their own first, so a write through
/// one view is never observed through another.
#[derive(Clone)]
pub struct HeaderValues {
    backing: Arc<[String]>,
    range: Range<usize>,
}

impl HeaderValues {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        let len = values.len();
        Self {
            backing: values.into(),
            range: 0..len,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn view(backing: &Arc<[String]>, range: Range<usize>) -> Self {
        Self {
            backing: Arc::clone(backing),
            range,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.backing[self.range.clone()]
    }

    /// Appends a value. The view is detached from any shared buffer.
    pub fn push(&mut self, value: String) {
        let mut values = Vec::with_capacity(self.len() + 1);
        values.extend_from_slice(self.as_slice());
        values.push(value);
        *self = Self::new(values);
    }

    /// Mutable access to the values, copying them out of a shared buffer first.
    pub fn make_mut(&mut self) -> &mut [String] {
        let owns_buffer = self.range.start == 0
            && self.range.end == self.backing.len()
            && Arc::get_mut(&mut self.backing).is_some();
        if !owns_buffer {
            *self = Self::new(self.as_slice().to_vec());
        }
        match Arc::get_mut(&mut self.backing) {
            Some(values) => values,
            None => &mut [],
        }
    }

    /// Whether both views read from the same backing buffer.
    #[must_use]
    pub fn shares_backing_with(&self, other: &HeaderValues) -> bool {
        Arc::ptr_eq(&self.backing, &other.backing)
    }
}

impl Deref for HeaderValues {
    type Target = [String];

    fn deref(&self) -> &[String] {
        self.as_slice()
    }
}

impl PartialEq for HeaderValues {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for HeaderValues {}

impl fmt::Debug for HeaderValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl From<Vec<String>> for HeaderValues {
    fn from(values: Vec<String>) -> Self {
        Self::new(values)
    }
}

impl<'a> FromIterator<&'a str> for HeaderValues {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(str::to_string).collect())
    }
}

/// Marker for maps attached to bus messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Native;

/// Marker for maps used as propagation carriers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Carrier;

/// Map from header key to an optional ordered list of values.
///
/// `N` is [`Native`] or [`Carrier`]; use the [`Headers`] and [`HeaderCarrier`]
/// aliases.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiValueMap<N> {
    entries: HashMap<String, Option<HeaderValues>>,
    _namespace: PhantomData<N>,
}

/// Headers carried by a bus message.
pub type Headers = MultiValueMap<Native>;

/// Generic carrier read and written by propagators.
pub type HeaderCarrier = MultiValueMap<Carrier>;

impl<N> MultiValueMap<N> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            _namespace: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces the values of `key` with the single `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), Some(HeaderValues::new(vec![value.into()])));
    }

    /// Adds `value` after the existing values of `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        match self.entries.entry(key.into()) {
            hash_map::Entry::Occupied(mut entry) => match entry.get_mut() {
                Some(values) => values.push(value.into()),
                slot @ None => *slot = Some(HeaderValues::new(vec![value.into()])),
            },
            hash_map::Entry::Vacant(entry) => {
                entry.insert(Some(HeaderValues::new(vec![value.into()])));
            }
        }
    }

    /// Sets the raw value list of `key`, `None` included.
    pub fn insert_values(&mut self, key: impl Into<String>, values: Option<HeaderValues>) {
        self.entries.insert(key.into(), values);
    }

    /// First value of `key` (exact match).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of `key` (exact match); `None` for absent keys and nil lists.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Option<&HeaderValues> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    /// Raw entry of `key`, distinguishing an absent key (`None`) from a nil
    /// value list (`Some(None)`).
    #[must_use]
    pub fn entry_values(&self, key: &str) -> Option<Option<&HeaderValues>> {
        self.entries.get(key).map(Option::as_ref)
    }

    pub fn values_mut(&mut self, key: &str) -> Option<&mut Option<HeaderValues>> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<HeaderValues>> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&HeaderValues>)> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_ref()))
    }

    /// Total number of values across all keys.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.entries
            .values()
            .map(|values| values.as_ref().map_or(0, |v| v.len()))
            .sum()
    }

    // Same algorithm as `http.Header.Clone`: one buffer for every value, one
    // view per key, nil lists kept nil.
    fn convert<M>(&self) -> MultiValueMap<M> {
        let mut buffer = Vec::with_capacity(self.value_count());
        let mut ranges = Vec::with_capacity(self.entries.len());
        for (key, values) in &self.entries {
            let range = values.as_ref().map(|values| {
                let start = buffer.len();
                buffer.extend_from_slice(values.as_slice());
                start..buffer.len()
            });
            ranges.push((key, range));
        }

        let backing: Arc<[String]> = buffer.into();
        let mut entries = HashMap::with_capacity(ranges.len());
        for (key, range) in ranges {
            let values = range.map(|range| HeaderValues::view(&backing, range));
            entries.insert(key.clone(), values);
        }

        MultiValueMap {
            entries,
            _namespace: PhantomData,
        }
    }
}

impl<'a, N> FromIterator<(&'a str, &'a str)> for MultiValueMap<N> {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.append(key, value);
        }
        map
    }
}

impl Headers {
    /// Copies these headers into a propagation carrier.
    #[must_use]
    pub fn to_carrier(&self) -> HeaderCarrier {
        self.convert()
    }
}

impl HeaderCarrier {
    /// Copies this carrier into bus headers.
    #[must_use]
    pub fn to_native(&self) -> Headers {
        self.convert()
    }

    fn find_ignore_case(&self, key: &str) -> Option<&Option<HeaderValues>> {
        self.entries.get(key).or_else(|| {
            self.entries
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, values)| values)
        })
    }
}

/// Converts bus headers into a carrier. A message without headers yields no carrier.
#[must_use]
pub fn to_carrier(headers: Option<&Headers>) -> Option<HeaderCarrier> {
    headers.map(Headers::to_carrier)
}

/// Converts a carrier into bus headers. No carrier yields no headers.
#[must_use]
pub fn to_native(carrier: Option<&HeaderCarrier>) -> Option<Headers> {
    carrier.map(HeaderCarrier::to_native)
}

impl Injector for HeaderCarrier {
    /// Replaces every spelling of `key` with a single lower-case key holding `value`.
    fn set(&mut self, key: &str, value: String) {
        self.entries.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.entries.insert(
            key.to_ascii_lowercase(),
            Some(HeaderValues::new(vec![value])),
        );
    }
}

impl Extractor for HeaderCarrier {
    /// First value of `key`, matched case-insensitively.
    ///
    /// Peers that canonicalise header names (`Traceparent`) are still read.
    fn get(&self, key: &str) -> Option<&str> {
        let lower = key.to_ascii_lowercase();
        self.find_ignore_case(&lower)
            .and_then(Option::as_ref)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
