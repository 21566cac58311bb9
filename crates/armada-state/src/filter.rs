//! List filters shared by every resource kind.

use std::collections::BTreeMap;

use crate::ledger::LedgerRecord;

/// Inclusive version bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub gte: Option<u64>,
    pub lte: Option<u64>,
    pub eq: Option<u64>,
}

impl VersionRange {
    pub fn contains(&self, version: u64) -> bool {
        self.gte.is_none_or(|v| version >= v)
            && self.lte.is_none_or(|v| version <= v)
            && self.eq.is_none_or(|v| version == v)
    }
}

/// Uniform list filter. Empty collections impose no restriction.
///
/// Deleted records are excluded unless `include_deleted` is set. Named
/// `fields` are resolved through [`LedgerRecord::field`].
#[derive(Debug, Clone)]
pub struct Filter<S> {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    pub version: VersionRange,
    pub states: Vec<S>,
    pub exclude_states: Vec<S>,
    pub fields: BTreeMap<String, String>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl<S> Default for Filter<S> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            names: Vec::new(),
            version: VersionRange::default(),
            states: Vec::new(),
            exclude_states: Vec::new(),
            fields: BTreeMap::new(),
            include_deleted: false,
            limit: None,
        }
    }
}

impl<S: PartialEq> Filter<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn version(mut self, version: VersionRange) -> Self {
        self.version = version;
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn exclude_states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.exclude_states = states.into_iter().collect();
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes every predicate except `limit`.
    pub fn matches<R: LedgerRecord<State = S>>(&self, record: &R) -> bool {
        let metadata = record.metadata();
        let state = &record.status().state;

        (self.include_deleted || !record.is_deleted())
            && (self.ids.is_empty() || self.ids.contains(&metadata.id))
            && (self.names.is_empty() || self.names.iter().any(|n| n == record.name()))
            && self.version.contains(metadata.version)
            && (self.states.is_empty() || self.states.contains(state))
            && !self.exclude_states.contains(state)
            && self
                .fields
                .iter()
                .all(|(name, value)| record.field(name) == Some(value.as_str()))
    }
}
