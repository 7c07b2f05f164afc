//! Conflict rules and their value indexes.
//!
//! A [`ConflictRule`] declares that the concatenation of some subset of an
//! item's properties must be unique across entities (for example, sibling
//! folder names). The rule keeps a reverse index from that *conflict value*
//! to the lookup key of the item currently holding it, which is how the
//! resolver detects unrelated items colliding on a shared attribute.
//!
//! Rules are registered once per (adapter, type) at startup. A working copy
//! without any indexed values is cloned per session via
//! [`ConflictRule::clone_without_values`], so one session's conflict state
//! never leaks into the next.

use crate::{item::SyncItem, LookupKey, TypeId};
use std::collections::HashMap;

/// Separator between property values inside a conflict value string.
/// A control character so that composed values cannot collide with a
/// legitimate property value containing the separator.
const VALUE_SEPARATOR: &str = "\u{1}";

/// A named uniqueness rule over a subset of an item's properties.
#[derive(Debug, Clone)]
pub struct ConflictRule {
    name: String,
    type_id: Option<TypeId>,
    property_names: Vec<String>,
    value_index: HashMap<String, LookupKey>,
}

impl ConflictRule {
    /// Create a rule that applies to every item of its component.
    pub fn new(name: impl Into<String>, property_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            type_id: None,
            property_names,
            value_index: HashMap::new(),
        }
    }

    /// Restrict the rule to one entity type.
    pub fn with_type(mut self, type_id: impl Into<TypeId>) -> Self {
        self.type_id = Some(type_id.into());
        self
    }

    /// The rule's name, passed to adapters when a conflict fires.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the rule applies to this item's type.
    pub fn applies_to(&self, item: &SyncItem) -> bool {
        match &self.type_id {
            Some(type_id) => item.type_id.as_ref() == Some(type_id),
            None => true,
        }
    }

    /// Concatenate the item's values for this rule's properties.
    ///
    /// Returns `None` if the rule does not apply to the item or any required
    /// property is absent (the partial-update case). Callers must treat
    /// "cannot evaluate" as "no conflict".
    pub fn conflict_value(&self, item: &SyncItem) -> Option<String> {
        if !self.applies_to(item) {
            return None;
        }
        let mut parts = Vec::with_capacity(self.property_names.len());
        for name in &self.property_names {
            parts.push(item.property(name)?);
        }
        Some(parts.join(VALUE_SEPARATOR))
    }

    /// Index a conflict value as held by `owner`. Re-adding an existing
    /// value overwrites its owner.
    pub fn add_value(&mut self, value: impl Into<String>, owner: LookupKey) {
        self.value_index.insert(value.into(), owner);
    }

    /// Whether any item currently holds this conflict value.
    pub fn has_value(&self, value: &str) -> bool {
        self.value_index.contains_key(value)
    }

    /// The lookup key of the item holding this conflict value.
    pub fn owner_of(&self, value: &str) -> Option<&LookupKey> {
        self.value_index.get(value)
    }

    /// Shift index entries from an item's old state to its new state.
    ///
    /// Removes the entry for `old_item`'s value if and only if `old_item`
    /// still owns it, then indexes `new_item`'s value (unless `new_item` is
    /// a removal).
    pub fn update_values(&mut self, old_item: &SyncItem, new_item: &SyncItem) {
        self.delete_values(old_item);
        if !new_item.is_remove {
            if let Some(value) = self.conflict_value(new_item) {
                self.add_value(value, new_item.lookup_key());
            }
        }
    }

    /// Drop `old_item`'s index entry when `update` is a removal or clears
    /// the rule's properties.
    ///
    /// Never deletes another item's claim on a value.
    pub fn maybe_delete_values(&mut self, old_item: &SyncItem, update: &SyncItem) {
        if !update.is_remove && self.conflict_value(update).is_some() {
            return;
        }
        self.delete_values(old_item);
    }

    /// Drop the index entry for `item`'s value, if `item` still owns it.
    pub fn delete_values(&mut self, item: &SyncItem) {
        if let Some(value) = self.conflict_value(item) {
            if self.value_index.get(&value) == Some(&item.lookup_key()) {
                self.value_index.remove(&value);
            }
        }
    }

    /// Structural copy of the rule definition with an empty index.
    ///
    /// Sessions snapshot rule definitions this way so no stale index state
    /// carries over between runs.
    pub fn clone_without_values(&self) -> Self {
        Self {
            name: self.name.clone(),
            type_id: self.type_id.clone(),
            property_names: self.property_names.clone(),
            value_index: HashMap::new(),
        }
    }
}
