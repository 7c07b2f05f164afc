//! The coalescing update queue.
//!
//! An [`UpdateQueue`] holds pending [`SyncItem`]s in insertion order, keyed
//! by lookup key. Adding an item whose key is already present *smooshes*
//! (coalesces) it onto the existing entry instead of duplicating it, so one
//! uncommitted batch never carries two entries for the same entity.
//!
//! Queues are session-scoped: a queue is discarded once its session
//! completes, after any leftover items are recycled into the next one via
//! [`UpdateQueue::append`].

use crate::{item::SyncItem, LookupKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// An ordered, deduplicating collection of pending sync items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQueue {
    items: HashMap<LookupKey, SyncItem>,
    order: VecDeque<LookupKey>,
}

impl UpdateQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item, coalescing with any existing item at the same lookup
    /// key via smoosh semantics.
    ///
    /// Returns whether the queue's content actually changed (a smoosh that
    /// writes nothing new reports `false`).
    pub fn add_item(&mut self, item: SyncItem) -> bool {
        let key = item.lookup_key();
        match self.items.get_mut(&key) {
            Some(existing) => Self::smoosh_items(existing, &item),
            None => {
                self.order.push_back(key.clone());
                self.items.insert(key, item);
                true
            }
        }
    }

    /// Unconditionally overwrite any entry at the item's lookup key.
    ///
    /// Used when a resolved item must win outright over whatever was queued.
    pub fn replace_item(&mut self, item: SyncItem) {
        let key = item.lookup_key();
        if !self.items.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.items.insert(key, item);
    }

    /// Get the queued item for a lookup key.
    pub fn item(&self, key: &str) -> Option<&SyncItem> {
        self.items.get(key)
    }

    /// Remove and return the queued item for a lookup key.
    pub fn delete_item(&mut self, key: &str) -> Option<SyncItem> {
        let removed = self.items.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// All pending items in insertion order.
    pub fn pending(&self) -> Vec<&SyncItem> {
        self.order.iter().filter_map(|k| self.items.get(k)).collect()
    }

    /// Number of pending items.
    pub fn pending_size(&self) -> usize {
        self.items.len()
    }

    /// Whether anything is pending.
    pub fn has_pending(&self) -> bool {
        !self.items.is_empty()
    }

    /// FIFO pop of the oldest pending item.
    ///
    /// Must never be interleaved with iteration over the same queue; the
    /// pipeline drains a queue either by popping or by iterating, not both.
    pub fn pop_next_item(&mut self) -> Option<SyncItem> {
        let key = self.order.pop_front()?;
        self.items.remove(&key)
    }

    /// Merge another queue's pending items on top of this one's.
    ///
    /// Used to recycle unsent items back into the live queue after a
    /// cancelled or failed session. Colliding keys smoosh, the appended
    /// queue's fields winning.
    pub fn append(&mut self, other: UpdateQueue) {
        for item in other.into_pending() {
            self.add_item(item);
        }
    }

    /// Consume the queue, yielding pending items in insertion order.
    pub fn into_pending(mut self) -> Vec<SyncItem> {
        let mut items = Vec::with_capacity(self.items.len());
        while let Some(item) = self.pop_next_item() {
            items.push(item);
        }
        items
    }

    /// Merge `update`'s fields onto `base` in place.
    ///
    /// A removal on `update` wins entirely: it replaces `base`'s properties
    /// with the removal's identity-only set. An update on top of a prior
    /// removal is a logical re-creation and clears the removed flag. Returns
    /// whether anything actually changed, so callers can detect no-op
    /// updates and skip redundant uploads.
    pub fn smoosh_items(base: &mut SyncItem, update: &SyncItem) -> bool {
        let mut changed = false;

        if update.is_remove {
            if !base.is_remove {
                base.is_remove = true;
                changed = true;
            }
            if base.raw_properties() != update.raw_properties() {
                base.set_raw_properties(update.raw_properties().clone());
                changed = true;
            }
        } else {
            if base.is_remove {
                base.is_remove = false;
                changed = true;
            }
            for (name, value) in update.raw_properties() {
                if base.raw_properties().get(name) != Some(value) {
                    match value {
                        Some(v) => base.set_property(name.clone(), v.clone()),
                        None => base.set_null_property(name.clone()),
                    }
                    changed = true;
                }
            }
        }

        if update.is_remove_all && !base.is_remove_all {
            base.is_remove_all = true;
            changed = true;
        }
        if update.is_encrypted != base.is_encrypted {
            base.is_encrypted = update.is_encrypted;
            changed = true;
        }

        changed
    }
}
