//! Category filters
//!
//! A category filter decides, at load time, which layer names are kept and
//! which class id each kept layer receives. The explicit variant maps names
//! to fixed ids; the open-set variant keeps a name list and assigns ids
//! pseudo-randomly on first encounter, drawing without replacement from
//! 1..=255 (0 is reserved for background and would erase the layer from
//! every class map).

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::normalize_name;

/// Per-codec-instance policy for interpreting layer names.
#[derive(Debug, Clone)]
pub enum CategoryFilter {
    /// Fixed name to class id mapping, used verbatim.
    Explicit(IndexMap<String, u8>),
    /// Name allow-list with lazily assigned ids.
    OpenSet(OpenSet),
}

/// Lazy id assignment state of an open-set filter.
///
/// The id pool is shuffled once at construction; assignment pops from it on
/// first encounter, so two filters built with the same seed hand out the same
/// ids for the same encounter order.
#[derive(Debug, Clone)]
pub struct OpenSet {
    names: Vec<String>,
    assigned: IndexMap<String, u8>,
    pool: Vec<u8>,
}

impl OpenSet {
    fn new(names: Vec<String>, mut rng: StdRng) -> Self {
        let mut pool: Vec<u8> = (1..=u8::MAX).collect();
        pool.shuffle(&mut rng);
        // popping from the back keeps assignment O(1)
        pool.reverse();
        Self {
            names,
            assigned: IndexMap::new(),
            pool,
        }
    }

    fn resolve(&mut self, key: &str) -> Option<u8> {
        if !self.names.iter().any(|n| n == key) {
            return None;
        }
        if let Some(id) = self.assigned.get(key) {
            return Some(*id);
        }
        let id = self.pool.pop()?;
        debug!("assigned class id {} to category '{}'", id, key);
        self.assigned.insert(key.to_string(), id);
        Some(id)
    }

    /// Ids handed out so far, in encounter order.
    pub fn assigned(&self) -> &IndexMap<String, u8> {
        &self.assigned
    }
}

impl CategoryFilter {
    /// Build an explicit filter. Names are normalized on the way in.
    pub fn explicit<I, S>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (S, u8)>,
        S: AsRef<str>,
    {
        let map = mapping
            .into_iter()
            .map(|(name, id)| (normalize_name(name.as_ref()), id))
            .collect();
        CategoryFilter::Explicit(map)
    }

    /// Build an open-set filter drawing ids from thread entropy. Repeated
    /// loads are not guaranteed to reproduce identical ids.
    pub fn open_set<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| normalize_name(n.as_ref()))
            .collect();
        CategoryFilter::OpenSet(OpenSet::new(names, StdRng::from_entropy()))
    }

    /// Build an open-set filter with a fixed seed, so id assignment is
    /// reproducible across instances.
    pub fn open_set_seeded<I, S>(names: I, seed: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| normalize_name(n.as_ref()))
            .collect();
        CategoryFilter::OpenSet(OpenSet::new(names, StdRng::seed_from_u64(seed)))
    }

    /// Parse a category file: a JSON object of name to integer id becomes an
    /// explicit filter, a JSON array of names an open-set one.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(entries) => {
                let mut map = IndexMap::new();
                for (name, id) in entries {
                    let id = id
                        .as_u64()
                        .and_then(|v| u8::try_from(v).ok())
                        .ok_or_else(|| {
                            Error::InvalidFormat(format!(
                                "category '{name}' has no valid class id (expected 0..=255)"
                            ))
                        })?;
                    map.insert(normalize_name(&name), id);
                }
                Ok(CategoryFilter::Explicit(map))
            }
            Value::Array(entries) => {
                let mut names = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        Value::String(name) => names.push(name),
                        other => {
                            return Err(Error::InvalidFormat(format!(
                                "category list entries must be strings, got {other}"
                            )))
                        }
                    }
                }
                Ok(CategoryFilter::open_set(names))
            }
            other => Err(Error::InvalidFormat(format!(
                "category file must be a JSON object or array, got {other}"
            ))),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Category names, in declaration order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            CategoryFilter::Explicit(map) => map.keys().map(String::as_str).collect(),
            CategoryFilter::OpenSet(set) => set.names.iter().map(String::as_str).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = normalize_name(name);
        match self {
            CategoryFilter::Explicit(map) => map.contains_key(&key),
            CategoryFilter::OpenSet(set) => set.names.iter().any(|n| *n == key),
        }
    }

    /// Class id for a layer name, or `None` when the layer must be dropped.
    ///
    /// Open-set filters assign an id on the first call for each name and
    /// return the same id afterwards for the lifetime of the filter.
    pub fn resolve(&mut self, name: &str) -> Option<u8> {
        let key = normalize_name(name);
        match self {
            CategoryFilter::Explicit(map) => map.get(&key).copied(),
            CategoryFilter::OpenSet(set) => set.resolve(&key),
        }
    }
}
