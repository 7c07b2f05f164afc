//! The sync item value type.
//!
//! A [`SyncItem`] is one change to one logical entity. Items are value-like:
//! they are cloned whenever they cross an ownership boundary that might later
//! diverge (a queue versus in-flight processing), so two holders can never
//! observe each other's mutations.

use crate::{
    error::{Error, Result},
    ComponentId, ItemId, LookupKey, TypeId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One change to one logical entity.
///
/// Identity is `(component_id, item_id[, type_id])`; everything else is
/// mutable change payload. A removal item carries no meaningful properties
/// beyond whatever is needed to reconstruct its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    /// The owning component (data-source adapter)
    pub component_id: ComponentId,
    /// Entity type within the component, where the component is typed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<TypeId>,
    /// Unique within the component (and type, where typed)
    pub item_id: ItemId,
    /// Whether this item deletes the entity
    pub is_remove: bool,
    /// Whether this item clears the whole component
    pub is_remove_all: bool,
    /// Whether the payload must be encrypted before upload
    pub is_encrypted: bool,
    /// Open string-keyed payload; values may be explicitly null
    properties: HashMap<String, Option<String>>,
}

impl SyncItem {
    /// Create a new item for the given component and entity.
    pub fn new(component_id: impl Into<ComponentId>, item_id: impl Into<ItemId>) -> Self {
        Self {
            component_id: component_id.into(),
            type_id: None,
            item_id: item_id.into(),
            is_remove: false,
            is_remove_all: false,
            is_encrypted: false,
            properties: HashMap::new(),
        }
    }

    /// Create a removal item for the given component and entity.
    pub fn removal(component_id: impl Into<ComponentId>, item_id: impl Into<ItemId>) -> Self {
        let mut item = Self::new(component_id, item_id);
        item.is_remove = true;
        item
    }

    /// Set the entity type (builder style).
    pub fn with_type(mut self, type_id: impl Into<TypeId>) -> Self {
        self.type_id = Some(type_id.into());
        self
    }

    /// Set a property value.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), Some(value.into()));
    }

    /// Set a property to an explicit null.
    ///
    /// A null property is *present* (`has_property` is true) but carries no
    /// value; smooshing propagates it like any other write.
    pub fn set_null_property(&mut self, name: impl Into<String>) {
        self.properties.insert(name.into(), None);
    }

    /// Get a property value. Returns `None` for absent and null properties.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_deref())
    }

    /// Check whether a property is present (including explicit nulls).
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Delete a property. Returns whether it was present.
    pub fn delete_property(&mut self, name: &str) -> bool {
        self.properties.remove(name).is_some()
    }

    /// Remove all properties.
    pub fn clear_properties(&mut self) {
        self.properties.clear();
    }

    /// Number of properties, counting explicit nulls.
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Iterate over all properties, including explicit nulls.
    pub fn properties(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub(crate) fn raw_properties(&self) -> &HashMap<String, Option<String>> {
        &self.properties
    }

    pub(crate) fn set_raw_properties(&mut self, properties: HashMap<String, Option<String>>) {
        self.properties = properties;
    }

    /// The key identifying "the same logical entity" across queues, the
    /// server, and the local store: `componentId/itemId[/typeId]`.
    pub fn lookup_key(&self) -> LookupKey {
        match &self.type_id {
            Some(type_id) => format!("{}/{}/{}", self.component_id, self.item_id, type_id),
            None => format!("{}/{}", self.component_id, self.item_id),
        }
    }

    /// Overwrite every mutable field from another item of the same identity.
    ///
    /// Fails with [`Error::IdentityMismatch`] if the two items do not share a
    /// lookup key.
    pub fn update_from(&mut self, other: &SyncItem) -> Result<()> {
        if self.lookup_key() != other.lookup_key() {
            return Err(Error::IdentityMismatch {
                expected: self.lookup_key(),
                got: other.lookup_key(),
            });
        }
        self.is_remove = other.is_remove;
        self.is_remove_all = other.is_remove_all;
        self.is_encrypted = other.is_encrypted;
        self.properties = other.properties.clone();
        Ok(())
    }
}
