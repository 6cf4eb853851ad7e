//! Match rules, sort filters and named rule sets.

use std::collections::BTreeMap;
use std::path::Path;

use bookhound_core::{load_json, save_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::algorithms::Settings;
use crate::error::{DupesError, Result};

/// One algorithm in a rule's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Settings::is_empty")]
    pub settings: Settings,
}

impl AlgorithmSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }
}

/// A field plus the algorithm chain applied to its values, left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    pub field: String,
    pub algorithms: Vec<AlgorithmSpec>,
    /// Each item of a multi-valued field becomes its own hash token, so
    /// books sharing any one item match.
    #[serde(default)]
    pub multiply: bool,
    /// Treat a composite field as holding personal names.
    #[serde(default)]
    pub composite_has_names: bool,
}

impl MatchRule {
    pub fn new(field: impl Into<String>, algorithms: &[&str]) -> Self {
        Self {
            field: field.into(),
            algorithms: algorithms.iter().map(|name| AlgorithmSpec::new(*name)).collect(),
            multiply: false,
            composite_has_names: false,
        }
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmSpec) -> Self {
        self.algorithms.push(algorithm);
        self
    }

    pub fn multiply(mut self) -> Self {
        self.multiply = true;
        self
    }

    pub fn composite_names(mut self) -> Self {
        self.composite_has_names = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    Text,
    Number,
    Date,
}

/// Orders books inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortFilter {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<TypeHint>,
}

impl SortFilter {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
            type_hint: None,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            descending: true,
            ..Self::ascending(field)
        }
    }

    pub fn with_hint(mut self, hint: TypeHint) -> Self {
        self.type_hint = Some(hint);
        self
    }
}

/// Match rules and sort filters saved under a name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub match_rules: Vec<MatchRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_filters: Vec<SortFilter>,
}

impl RuleSet {
    pub fn new(match_rules: Vec<MatchRule>) -> Self {
        Self {
            match_rules,
            sort_filters: Vec::new(),
        }
    }

    pub fn with_sort_filters(mut self, filters: Vec<SortFilter>) -> Self {
        self.sort_filters = filters;
        self
    }

    /// Similar title and similar author, the usual starting point.
    pub fn title_author() -> Self {
        Self::new(vec![
            MatchRule::new("title", &["similar"]),
            MatchRule::new("authors", &["similar"]),
        ])
    }
}

/// Rule sets persisted as one JSON object keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSetStore {
    sets: BTreeMap<String, RuleSet>,
}

impl RuleSetStore {
    pub const TITLE_AUTHOR: &'static str = "title-author";

    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_json(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        Ok(save_json(path, self)?)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Stored set, or the built-in `title-author` preset.
    pub fn get(&self, name: &str) -> Result<RuleSet> {
        match self.sets.get(name) {
            Some(set) => Ok(set.clone()),
            None if name == Self::TITLE_AUTHOR => Ok(RuleSet::title_author()),
            None => Err(DupesError::UnknownRuleSet(name.to_string())),
        }
    }

    /// Insert or replace.
    pub fn insert(&mut self, name: impl Into<String>, set: RuleSet) -> Option<RuleSet> {
        self.sets.insert(name.into(), set)
    }

    pub fn remove(&mut self, name: &str) -> Result<RuleSet> {
        self.sets
            .remove(name)
            .ok_or_else(|| DupesError::UnknownRuleSet(name.to_string()))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.sets.contains_key(to) {
            return Err(DupesError::RuleSetExists(to.to_string()));
        }
        let set = self.remove(from)?;
        self.sets.insert(to.to_string(), set);
        Ok(())
    }
}
