//! Conflict detection and resolution.
//!
//! One [`ConflictResolver`] is constructed per synchronization session. It
//! owns the session's two update queues (to-server and apply-locally) and a
//! fresh, valueless snapshot of every registered conflict rule, so no index
//! state leaks between sessions.
//!
//! Resolution is not a single-pass fixed point. Each round can produce new
//! items that must themselves be re-run through the same algorithm, because
//! resolving one conflict can create another (renaming a folder to fix a
//! name collision can newly collide with a third folder). The session drives
//! that worklist; this type resolves one item at a time.

use crate::{
    adapter::ComponentAdapter, item::SyncItem, queue::UpdateQueue, rule::ConflictRule, ComponentId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Per-session conflict state: rule snapshots, the adapter registry, and the
/// two queues every resolution decision reads from and writes to.
pub struct ConflictResolver {
    /// Session-scoped rule snapshots, grouped by component
    rules: HashMap<ComponentId, Vec<ConflictRule>>,
    adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    /// Items to upload at the end of the session
    to_server: UpdateQueue,
    /// Fully resolved items to hand to adapters at the end of the session
    to_apply: UpdateQueue,
}

impl ConflictResolver {
    /// Snapshot the registered rules (via `clone_without_values`) and take
    /// ownership of fresh session queues.
    pub fn new(
        registered_rules: &HashMap<ComponentId, Vec<ConflictRule>>,
        adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    ) -> Self {
        let rules = registered_rules
            .iter()
            .map(|(component, rules)| {
                (
                    component.clone(),
                    rules.iter().map(ConflictRule::clone_without_values).collect(),
                )
            })
            .collect();

        Self {
            rules,
            adapters,
            to_server: UpdateQueue::new(),
            to_apply: UpdateQueue::new(),
        }
    }

    /// The session's to-server queue.
    pub fn to_server(&self) -> &UpdateQueue {
        &self.to_server
    }

    pub fn to_server_mut(&mut self) -> &mut UpdateQueue {
        &mut self.to_server
    }

    /// The session's apply-locally queue.
    pub fn to_apply(&self) -> &UpdateQueue {
        &self.to_apply
    }

    pub fn to_apply_mut(&mut self) -> &mut UpdateQueue {
        &mut self.to_apply
    }

    /// Consume the resolver, yielding `(to_server, to_apply)`.
    pub fn into_queues(self) -> (UpdateQueue, UpdateQueue) {
        (self.to_server, self.to_apply)
    }

    /// The session's rule snapshots for one component.
    pub fn rules_for(&self, component: &str) -> &[ConflictRule] {
        self.rules.get(component).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Find a queued item for a lookup key. The apply-locally queue takes
    /// priority over to-server, since it reflects the fully resolved state.
    fn queued_item(&self, key: &str) -> Option<SyncItem> {
        self.to_apply
            .item(key)
            .or_else(|| self.to_server.item(key))
            .cloned()
    }

    fn index_item(rules: &mut [ConflictRule], item: &SyncItem) {
        if item.is_remove {
            return;
        }
        let key = item.lookup_key();
        for rule in rules {
            if !rule.applies_to(item) {
                continue;
            }
            match rule.conflict_value(item) {
                Some(value) => rule.add_value(value, key.clone()),
                // A partial update should never reach this point missing
                // rule-required properties.
                None => error!(
                    item = %key,
                    rule = rule.name(),
                    "item is missing conflict-rule properties"
                ),
            }
        }
    }

    /// Index a non-removal item's conflict values under every applicable
    /// rule of its component.
    pub fn add_to_conflict_maps(&mut self, item: &SyncItem) {
        if let Some(rules) = self.rules.get_mut(&item.component_id) {
            Self::index_item(rules, item);
        }
    }

    /// Shift rule indexes to reflect a batch of incoming items.
    ///
    /// For each item, the state it lands on is whatever is already queued
    /// under the same lookup key. If nothing is queued (or only a removal),
    /// the item is indexed fresh. Otherwise the indexes move from the old
    /// queued state to the state that would result from merging: a smoosh
    /// when `is_update`, the incoming item alone otherwise.
    pub fn update_conflict_maps(&mut self, items: &[SyncItem], is_update: bool) {
        for item in items {
            let key = item.lookup_key();
            let existing = self.queued_item(&key);
            let Some(rules) = self.rules.get_mut(&item.component_id) else {
                continue;
            };
            match existing {
                Some(existing) if !existing.is_remove => {
                    let merged = if is_update {
                        let mut merged = existing.clone();
                        UpdateQueue::smoosh_items(&mut merged, item);
                        merged
                    } else {
                        item.clone()
                    };
                    if merged.is_remove {
                        for rule in rules.iter_mut() {
                            rule.maybe_delete_values(&existing, &merged);
                        }
                    } else {
                        for rule in rules.iter_mut() {
                            rule.update_values(&existing, &merged);
                        }
                    }
                }
                _ => Self::index_item(rules, item),
            }
        }
    }

    /// Reconcile a freshly downloaded item with any queued offline change
    /// for the same identity. Offline wins on every overlapping field.
    ///
    /// If the server says "removed" but the offline item is a live update,
    /// the owning adapter is asked for the full current entity so the final
    /// upload is not a silent partial update.
    ///
    /// Returns whether the two items ended up structurally equal, in which
    /// case the caller skips redundant local application. If the smoosh
    /// changed nothing, the redundant to-server entry is dropped.
    pub fn smoosh_with_offline(&mut self, synced: &mut SyncItem) -> bool {
        let key = synced.lookup_key();
        let Some(mut offline) = self.to_server.item(&key).cloned() else {
            return false;
        };

        if synced.is_remove && !offline.is_remove {
            match self.adapters.get(&synced.component_id) {
                Some(adapter) => {
                    match adapter.item_by_id(&synced.item_id, synced.type_id.as_deref()) {
                        Some(full) if full.lookup_key() == key => {
                            offline = full;
                            self.to_server.replace_item(offline.clone());
                        }
                        Some(full) => warn!(
                            expected = %key,
                            got = %full.lookup_key(),
                            "adapter returned a different identity from item_by_id"
                        ),
                        // Proceed with what is known.
                        None => warn!(
                            item = %key,
                            "adapter could not supply full state behind a remove collision"
                        ),
                    }
                }
                None => error!(component = %synced.component_id, "offline item for unregistered component"),
            }
        }

        let changed = UpdateQueue::smoosh_items(synced, &offline);
        if !changed {
            // The offline change adds nothing over the server state, so
            // uploading it again would be redundant.
            self.to_server.delete_item(&key);
        }

        *synced == offline
    }

    /// Run one item through one rule, delegating any detected collision to
    /// the owning adapter's resolution hook. Returns whether a conflict was
    /// found.
    ///
    /// Items returned by the adapter are pushed onto `resolved`; the caller
    /// feeds them back through [`ConflictResolver::resolve_conflicts`].
    pub fn resolve_item_conflicts(
        &mut self,
        synced: &mut SyncItem,
        rule: &mut ConflictRule,
        resolved: &mut Vec<SyncItem>,
    ) -> bool {
        let Some(value) = rule.conflict_value(synced) else {
            return false;
        };
        let synced_key = synced.lookup_key();
        let Some(owner) = rule.owner_of(&value).cloned() else {
            return false;
        };
        // Same identity: overlap is allowed, never a conflict with itself.
        if owner == synced_key {
            return false;
        }

        let Some(colliding) = self.queued_item(&owner) else {
            error!(
                owner = %owner,
                rule = rule.name(),
                "conflict index points at an item missing from both queues"
            );
            return false;
        };

        let Some(adapter) = self.adapters.get(&synced.component_id).cloned() else {
            error!(component = %synced.component_id, "conflict on unregistered component");
            return true;
        };

        let extra = adapter.on_item_conflict(rule.name(), synced, colliding);
        if synced.lookup_key() != synced_key {
            warn!(
                before = %synced_key,
                after = %synced.lookup_key(),
                "adapter changed item identity during conflict resolution"
            );
        }
        for item in extra {
            if item.lookup_key() == synced.lookup_key() {
                warn!(
                    key = %item.lookup_key(),
                    "adapter returned a resolution item duplicating the resolved identity"
                );
                continue;
            }
            resolved.push(item);
        }

        true
    }

    /// Fully resolve one item against every rule of its component.
    ///
    /// `is_downloaded` marks raw server data; an item that is itself the
    /// output of a prior resolution round is first smooshed with any queued
    /// item of the same identity, so resolution always builds on the latest
    /// known state. If any rule found a conflict, or the item was not
    /// server-downloaded, the item must be uploaded and is replaced into the
    /// to-server queue.
    ///
    /// Returns the additional items produced by adapters, which the caller
    /// must run through another resolution pass.
    pub fn resolve_conflicts(&mut self, synced: &mut SyncItem, is_downloaded: bool) -> Vec<SyncItem> {
        if !is_downloaded {
            if let Some(existing) = self.queued_item(&synced.lookup_key()) {
                let mut merged = existing;
                UpdateQueue::smoosh_items(&mut merged, synced);
                *synced = merged;
            }
        }

        let mut resolved = Vec::new();
        let mut needs_upload = !is_downloaded;

        let component = synced.component_id.clone();
        let mut rules = self.rules.remove(&component).unwrap_or_default();

        for rule in rules.iter_mut() {
            if self.resolve_item_conflicts(synced, rule, &mut resolved) {
                needs_upload = true;
            }
        }

        // Whatever the resolved items' previous queued state claimed in the
        // indexes is now stale; drop those claims. The items themselves are
        // re-indexed when they come back through resolution.
        for item in &resolved {
            if let Some(previous) = self.queued_item(&item.lookup_key()) {
                for rule in rules.iter_mut() {
                    rule.delete_values(&previous);
                }
            }
        }

        Self::index_item(&mut rules, synced);
        self.rules.insert(component, rules);

        if needs_upload {
            self.to_server.replace_item(synced.clone());
        }

        resolved
    }
}
