//! The component adapter contract.
//!
//! Each synchronized data source (bookmarks, tabs, passwords, ...) registers
//! one adapter translating between its native store and [`SyncItem`]s. The
//! pipeline treats adapters as semi-trusted plugins: contract violations are
//! logged loudly but never abort a run.

use crate::{error::Result, item::SyncItem, Priority};
use serde::{Deserialize, Serialize};

/// Which server timestamp cohort a component fetches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncBehavior {
    /// Fetch everything changed since the last full sync
    SinceLastSync,
    /// Fetch only what changed since the last update
    SinceLastUpdate,
}

/// A registered data source.
///
/// Implementations are expected to manage their own interior mutability;
/// the pipeline holds adapters behind `Arc` and only ever calls them from
/// its single logical thread.
pub trait ComponentAdapter: Send + Sync {
    /// The component identifier items of this adapter carry.
    fn component_id(&self) -> &str;

    /// Apply-order bucket for downloaded items; lower runs earlier, so
    /// structural data can land before the leaves that reference it.
    fn priority(&self) -> Priority;

    /// Timestamp cohort this component fetches from.
    fn sync_behavior(&self) -> SyncBehavior;

    /// Whether outgoing items must be flagged for payload encryption.
    fn encryption_required(&self) -> bool {
        false
    }

    /// Whether offline (durably held, unsent) items of this component are
    /// replayed at the start of a session.
    fn sync_offline_changes(&self) -> bool {
        true
    }

    /// Begin watching the native store for changes.
    fn start(&self) {}

    /// Stop watching the native store.
    fn stop(&self) {}

    /// Poll-based adapters report pending local changes here, right before
    /// a session takes its snapshot of the live queue.
    fn before_update(&self) -> Vec<SyncItem> {
        Vec::new()
    }

    /// Every current item of the component, used for whole-component
    /// re-imports.
    fn current_items(&self) -> Vec<SyncItem> {
        Vec::new()
    }

    /// Full current state of one entity, or `None` if it does not exist.
    ///
    /// Used to fill in complete state behind a partial/remove collision so
    /// the final upload is not a silent partial update.
    fn item_by_id(&self, item_id: &str, type_id: Option<&str>) -> Option<SyncItem>;

    /// Called with a clone of each downloaded item just before conflict
    /// resolution, for adapter-side bookkeeping.
    fn on_before_resolve_conflict(&self, _item: &SyncItem) {}

    /// Resolve a collision between `synced` and a previously indexed item.
    ///
    /// The adapter may mutate `synced` in place, but must not change its
    /// identity. Any returned items are themselves re-run through conflict
    /// resolution; they must not duplicate `synced`'s identity.
    fn on_item_conflict(
        &self,
        rule_name: &str,
        synced: &mut SyncItem,
        colliding: SyncItem,
    ) -> Vec<SyncItem>;

    /// Apply one fully resolved item to the native store.
    fn on_item_available(&self, item: &SyncItem) -> Result<()>;
}
