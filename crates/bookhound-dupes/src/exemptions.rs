//! "Not a duplicate" declarations.
//!
//! Members of one exemption set are never placed in the same group. Adding a
//! set that overlaps an existing one merges them, so membership is
//! transitive. Sets are kept explicitly (rather than as a union-find forest)
//! because single members can be taken back out.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;

use bookhound_core::{BookId, load_json, save_json};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExemptionScope {
    #[default]
    Book,
    Author,
}

impl ExemptionScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "book" | "books" => Some(ExemptionScope::Book),
            "author" | "authors" => Some(ExemptionScope::Author),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptionStore<K: Ord> {
    sets: BTreeMap<usize, BTreeSet<K>>,
    index: BTreeMap<K, usize>,
    next_id: usize,
}

impl<K: Ord> Default for ExemptionStore<K> {
    fn default() -> Self {
        Self {
            sets: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: 0,
        }
    }
}

pub type BookExemptions = ExemptionStore<BookId>;
pub type AuthorExemptions = ExemptionStore<String>;

impl<K: Ord + Clone> ExemptionStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `members` mutually non-duplicate. Existing sets that share a
    /// member are merged in. Fewer than two distinct members is a no-op.
    pub fn add_exemption(&mut self, members: impl IntoIterator<Item = K>) {
        let mut merged: BTreeSet<K> = members.into_iter().collect();
        if merged.len() < 2 {
            return;
        }

        let touched: BTreeSet<usize> = merged
            .iter()
            .filter_map(|m| self.index.get(m).copied())
            .collect();
        for id in touched {
            if let Some(set) = self.sets.remove(&id) {
                merged.extend(set);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        for member in &merged {
            self.index.insert(member.clone(), id);
        }
        self.sets.insert(id, merged);
    }

    /// Take `member` out of the set it shares with `from`. Sets left with a
    /// single member are dropped. Returns whether anything changed.
    pub fn remove_exemption(&mut self, member: &K, from: &K) -> bool {
        let (Some(&id), Some(&other)) = (self.index.get(member), self.index.get(from)) else {
            return false;
        };
        if id != other || member == from {
            return false;
        }

        self.index.remove(member);
        let Some(set) = self.sets.get_mut(&id) else {
            return false;
        };
        set.remove(member);
        if set.len() <= 1 {
            for rest in std::mem::take(set) {
                self.index.remove(&rest);
            }
            self.sets.remove(&id);
        }
        true
    }

    /// The whole set containing `member`, or just `{member}` when not exempt.
    pub fn set_for(&self, member: &K) -> BTreeSet<K> {
        self.index
            .get(member)
            .and_then(|id| self.sets.get(id))
            .cloned()
            .unwrap_or_else(|| BTreeSet::from([member.clone()]))
    }

    /// Members `member` must not be grouped with.
    pub fn exempt_from(&self, member: &K) -> BTreeSet<K> {
        let mut set = self.set_for(member);
        set.remove(member);
        set
    }

    pub fn is_exempt(&self, member: &K) -> bool {
        self.index.contains_key(member)
    }

    pub fn are_exempt(&self, a: &K, b: &K) -> bool {
        a != b
            && matches!(
                (self.index.get(a), self.index.get(b)),
                (Some(x), Some(y)) if x == y
            )
    }

    pub fn sets(&self) -> impl Iterator<Item = &BTreeSet<K>> {
        self.sets.values()
    }

    /// Every exempt pair `(a, b)` with `a < b`.
    pub fn exempt_pairs(&self) -> Vec<(K, K)> {
        let mut pairs = Vec::new();
        for set in self.sets.values() {
            for (i, a) in set.iter().enumerate() {
                for b in set.iter().skip(i + 1) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs
    }

    /// Number of sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.index.clear();
    }
}

impl<K> ExemptionStore<K>
where
    K: Ord + Clone + Display + Serialize + DeserializeOwned,
{
    /// Persisted form: every member maps to the sorted members of its set.
    pub fn to_map(&self) -> BTreeMap<String, Vec<K>> {
        self.index
            .keys()
            .map(|member| {
                (
                    member.to_string(),
                    self.set_for(member).into_iter().collect(),
                )
            })
            .collect()
    }

    pub fn from_map(map: BTreeMap<String, Vec<K>>) -> Self {
        let mut store = Self::new();
        for members in map.into_values() {
            store.add_exemption(members);
        }
        store
    }

    pub fn load(path: &Path) -> Result<Self> {
        let map: BTreeMap<String, Vec<K>> = load_json(path)?;
        Ok(Self::from_map(map))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, &self.to_map())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(ids: &[BookId]) -> BTreeSet<BookId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_add_merges_transitively() {
        let mut store = BookExemptions::new();
        store.add_exemption([1, 2]);
        store.add_exemption([3, 4]);
        assert_eq!(store.len(), 2);

        store.add_exemption([2, 3]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.set_for(&4), set(&[1, 2, 3, 4]));
        assert!(store.are_exempt(&1, &4));
        assert!(!store.are_exempt(&1, &1));
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = BookExemptions::new();
        store.add_exemption([1, 2, 3]);
        let before = store.to_map();
        store.add_exemption([3, 2, 1]);
        store.add_exemption([1]);
        assert_eq!(store.to_map(), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_shrinks_then_destroys() {
        let mut store = BookExemptions::new();
        store.add_exemption([1, 2, 3]);

        assert!(store.remove_exemption(&1, &2));
        assert!(!store.is_exempt(&1));
        assert_eq!(store.set_for(&2), set(&[2, 3]));

        assert!(store.remove_exemption(&3, &2));
        assert!(store.is_empty());
        assert!(!store.is_exempt(&2));
        assert!(!store.remove_exemption(&3, &2));
    }

    #[test]
    fn test_pairs_and_unexempt_set() {
        let mut store = BookExemptions::new();
        store.add_exemption([3, 1, 2]);
        assert_eq!(store.exempt_pairs(), vec![(1, 2), (1, 3), (2, 3)]);
        assert_eq!(store.set_for(&9), set(&[9]));
    }

    #[test]
    fn test_remove_requires_shared_set() {
        let mut store = BookExemptions::new();
        store.add_exemption([1, 2]);
        store.add_exemption([5, 6]);
        assert!(!store.remove_exemption(&1, &5));
        assert!(!store.remove_exemption(&1, &1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_exempt_from_excludes_self() {
        let mut store = AuthorExemptions::new();
        store.add_exemption(["Iain Banks".to_string(), "Iain M. Banks".to_string()]);
        assert_eq!(
            store.exempt_from(&"Iain Banks".to_string()),
            ["Iain M. Banks".to_string()].into_iter().collect()
        );
        assert!(store.exempt_from(&"Nobody".to_string()).is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exemptions").join("books.json");

        let mut store = BookExemptions::new();
        store.add_exemption([10, 11]);
        store.add_exemption([20, 21, 22]);
        store.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["21"], serde_json::json!([20, 21, 22]));

        let loaded = BookExemptions::load(&path).unwrap();
        assert_eq!(loaded.to_map(), store.to_map());
        assert!(loaded.are_exempt(&20, &22));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = AuthorExemptions::load(&dir.path().join("authors.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(ExemptionScope::parse("Authors"), Some(ExemptionScope::Author));
        assert_eq!(ExemptionScope::parse("book"), Some(ExemptionScope::Book));
        assert_eq!(ExemptionScope::parse("series"), None);
    }
}
