//! Typed collections: ordered sequences of schema records with a lazy identity index
//! and relational join helpers.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::ApiError;
use crate::object::{validate, Object, Schema};
use crate::types::{Key, Value};

/// Identity field used for indexing when none is configured.
pub const DEFAULT_IDENTITY: &str = "id";

/// Extracts a join/index key from a record.
pub trait Keyed {
    /// Key stored under `field`, if the record has a usable one.
    fn key(&self, field: &str) -> Option<Key>;
}

impl Keyed for Object {
    fn key(&self, field: &str) -> Option<Key> {
        self.get(field).and_then(Key::from_value)
    }
}

#[derive(Debug, Clone)]
enum Items<T> {
    /// Every raw item was a mapping and has been coerced into `T`.
    Typed(Vec<T>),
    /// At least one raw item was not a mapping; items are kept as-is.
    Raw(Vec<Value>),
}

/// How [`Collection::join_field`] attaches children to a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Every matching child, as a list (empty when there are none).
    Many,
    /// The last matching child, or null.
    One,
}

/// How [`Collection::search`] combines its filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    And,
    Or,
}

/// Ordered sequence of records of schema `T`.
///
/// Items are homogeneously coerced into `T` when every raw item is a mapping;
/// otherwise they pass through unmodified. The identity index is built on
/// first lookup and dropped whenever the sequence is mutated.
#[derive(Debug, Clone)]
pub struct Collection<T = Object> {
    items: Items<T>,
    identity: String,
    index: OnceLock<HashMap<Key, usize>>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: Items::Typed(Vec::new()),
            identity: DEFAULT_IDENTITY.to_string(),
            index: OnceLock::new(),
        }
    }
}

impl<T> Collection<T> {
    #[must_use]
    pub fn from_items(items: Vec<T>) -> Self {
        Self {
            items: Items::Typed(items),
            ..Self::default()
        }
    }

    /// Uses `field` as the identity for index lookups and joins.
    #[must_use]
    pub fn with_identity(mut self, field: impl Into<String>) -> Self {
        self.identity = field.into();
        self.index.take();
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.items {
            Items::Typed(items) => items.len(),
            Items::Raw(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when items were coerced into `T`.
    #[must_use]
    pub const fn is_typed(&self) -> bool {
        matches!(self.items, Items::Typed(_))
    }

    /// Typed items. Empty for a pass-through collection.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match &self.items {
            Items::Typed(items) => items,
            Items::Raw(_) => &[],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Mutable access to the typed items; drops the index.
    pub fn items_mut(&mut self) -> Option<&mut Vec<T>> {
        self.index.take();
        match &mut self.items {
            Items::Typed(items) => Some(items),
            Items::Raw(_) => None,
        }
    }

    /// Untyped items of a pass-through collection.
    #[must_use]
    pub fn raw_values(&self) -> Option<&[Value]> {
        match &self.items {
            Items::Typed(_) => None,
            Items::Raw(values) => Some(values),
        }
    }
}

impl<T: Schema> Collection<T> {
    /// Validates raw JSON items into `T` when all are mappings, else keeps them as-is.
    ///
    /// # Errors
    ///
    /// The first item's validation error.
    pub fn validate(raw: Vec<serde_json::Value>) -> Result<Self, ApiError> {
        if raw.iter().all(serde_json::Value::is_object) {
            let items = raw.into_iter().map(validate).collect::<Result<Vec<T>, _>>()?;
            Ok(Self::from_items(items))
        } else {
            Ok(Self {
                items: Items::Raw(raw.into_iter().map(Value::from).collect()),
                ..Self::default()
            })
        }
    }

    pub fn push(&mut self, item: T) {
        self.index.take();
        match &mut self.items {
            Items::Typed(items) => items.push(item),
            Items::Raw(values) => values.push(item.to_value()),
        }
    }

    /// Plain JSON form of every item.
    #[must_use]
    pub fn to_json(&self) -> Vec<serde_json::Value> {
        match &self.items {
            Items::Typed(items) => items
                .iter()
                .map(|item| serde_json::Value::from(&item.to_value()))
                .collect(),
            Items::Raw(values) => values.iter().map(serde_json::Value::from).collect(),
        }
    }
}

impl<T: Keyed> Collection<T> {
    fn index(&self) -> &HashMap<Key, usize> {
        self.index.get_or_init(|| {
            self.iter()
                .enumerate()
                .filter_map(|(pos, item)| item.key(&self.identity).map(|key| (key, pos)))
                .collect()
        })
    }

    /// Item whose identity field equals `key`.
    #[must_use]
    pub fn get_by_key(&self, key: &Key) -> Option<&T> {
        let pos = *self.index().get(key)?;
        self.as_slice().get(pos)
    }

    /// Attaches children to parents by foreign-key equality.
    ///
    /// Every parent receives its group, empty when nothing matched. Children
    /// whose foreign key matches no parent are dropped.
    pub fn join<C>(
        &mut self,
        children: impl IntoIterator<Item = C>,
        foreign_key: impl Fn(&C) -> Option<Key>,
        mut attach: impl FnMut(&mut T, Vec<C>),
    ) {
        let mut groups: Vec<Vec<C>> = std::iter::repeat_with(Vec::new).take(self.len()).collect();
        {
            let index = self.index();
            for child in children {
                match foreign_key(&child).and_then(|key| index.get(&key)) {
                    Some(&pos) => groups[pos].push(child),
                    None => debug!(identity = %self.identity, "dropping child without parent"),
                }
            }
        }
        if let Some(items) = self.items_mut() {
            for (item, group) in items.iter_mut().zip(groups) {
                attach(item, group);
            }
        }
    }

    /// Like [`join`](Self::join), collapsing each group to its last child.
    pub fn join_one<C>(
        &mut self,
        children: impl IntoIterator<Item = C>,
        foreign_key: impl Fn(&C) -> Option<Key>,
        mut attach: impl FnMut(&mut T, Option<C>),
    ) {
        self.join(children, foreign_key, |item, group| attach(item, group.into_iter().last()));
    }
}

impl Collection<Object> {
    /// Wraps raw JSON items without validation.
    #[must_use]
    pub fn passthrough(raw: Vec<serde_json::Value>) -> Self {
        if raw.iter().all(serde_json::Value::is_object) {
            let items = raw
                .into_iter()
                .filter_map(|item| match item {
                    serde_json::Value::Object(map) => Some(Object::passthrough(map)),
                    _ => None,
                })
                .collect();
            Self::from_items(items)
        } else {
            Self {
                items: Items::Raw(raw.into_iter().map(Value::from).collect()),
                ..Self::default()
            }
        }
    }

    /// Stores matching children under `group` on each parent.
    pub fn join_field(
        &mut self,
        children: &Self,
        foreign_key: &str,
        group: &str,
        mode: JoinMode,
    ) {
        let fk = |child: &Object| child.key(foreign_key);
        let children = children.iter().cloned();
        match mode {
            JoinMode::Many => self.join(children, fk, |parent, found| {
                parent.insert(group, Self::from_items(found));
            }),
            JoinMode::One => self.join_one(children, fk, |parent, found| {
                parent.insert(group, found);
            }),
        }
    }

    /// Items matching the filters.
    ///
    /// A filter matches when the item's field equals the filter value, or,
    /// with `case_insensitive`, when both are strings equal ignoring case.
    #[must_use]
    pub fn search(&self, filters: &Object, mode: SearchMode, case_insensitive: bool) -> Self {
        let matches = |item: &Object, name: &str, wanted: &Value| match item.get(name) {
            Some(actual) if actual == wanted => true,
            Some(Value::String(actual)) if case_insensitive => {
                wanted.as_str().is_some_and(|w| w.to_lowercase() == actual.to_lowercase())
            }
            _ => false,
        };
        let found = self
            .iter()
            .filter(|item| {
                let hits = filters.iter().filter(|(name, wanted)| matches(item, name, wanted)).count();
                match mode {
                    SearchMode::And => hits == filters.len(),
                    SearchMode::Or => hits > 0,
                }
            })
            .cloned()
            .collect();
        Self::from_items(found).with_identity(self.identity.clone())
    }

    /// Groups items by the value of `field`, in order of first appearance.
    ///
    /// Items without a usable key are skipped.
    #[must_use]
    pub fn group_by(&self, field: &str) -> IndexMap<Key, Self> {
        let mut groups: IndexMap<Key, Self> = IndexMap::new();
        for item in self.iter() {
            if let Some(key) = item.key(field) {
                groups.entry(key).or_default().push(item.clone());
            }
        }
        groups
    }

    /// Turns the list into a mapping keyed by `key`.
    ///
    /// Each entry holds the whole item, or only its `value` field when given.
    /// Duplicate keys keep the last item.
    #[must_use]
    pub fn transpose(&self, key: &str, value: Option<&str>) -> Object {
        self.iter()
            .filter_map(|item| {
                let name = item.key(key)?.to_string();
                let entry = match value {
                    Some(field) => item.get(field).cloned().unwrap_or_default(),
                    None => Value::Object(item.clone()),
                };
                Some((name, entry))
            })
            .collect()
    }

    /// Applies [`Object::group_enum`] to every item.
    pub fn group_enum(&mut self, name: &str, variants: &[&str]) {
        if let Some(items) = self.items_mut() {
            for item in items {
                item.group_enum(name, variants);
            }
        }
    }
}

impl<T> FromIterator<T> for Collection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_items(iter.into_iter().collect())
    }
}

impl<T: PartialEq> PartialEq for Collection<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.items, &other.items) {
            (Items::Typed(a), Items::Typed(b)) => a == b,
            (Items::Raw(a), Items::Raw(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Schema> fmt::Display for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::Array(self.to_json()))
    }
}

impl<T: Serialize> Serialize for Collection<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.items {
            Items::Typed(items) => serializer.collect_seq(items),
            Items::Raw(values) => serializer.collect_seq(values),
        }
    }
}

impl<'de, T: Schema> Deserialize<'de> for Collection<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        Self::validate(raw).map_err(serde::de::Error::custom)
    }
}
