//! Collaborator contracts at the IO boundary.
//!
//! The pipeline never talks to the network or disk itself. It drives three
//! async collaborators: a [`Transport`] that fetches remote changes, an
//! [`Updater`] that commits the to-server queue, and an [`OfflineStore`]
//! holding unsent items durably across restarts. Wire formats and
//! serialization live behind these traits.

use crate::error::Result;
use async_trait::async_trait;
use ferry_engine::{ComponentId, SyncItem, Timestamp};
use serde::{Deserialize, Serialize};

/// One fetch of remote changes for a cohort of components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Components whose changes are requested
    pub components: Vec<ComponentId>,
    /// Server timestamp to fetch from; `None` means everything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
}

/// Parsed remote changes plus the server timestamp they were read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub items: Vec<SyncItem>,
    pub server_timestamp: Timestamp,
}

/// The to-server queue of a finishing session, plus commit flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub items: Vec<SyncItem>,
    /// Whether the updater should merge in durably held offline items
    pub look_for_offline: bool,
    /// Whether to actually send to the server (false persists only)
    pub send_to_server: bool,
    /// Whether to rewrite the offline durability record
    pub write_offline_flag: bool,
}

/// Fetches remote changes. Multiple fetches may be in flight at once
/// (one per timestamp cohort); everything else in the pipeline is
/// single-threaded.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Commits an upload batch, returning the new server timestamp.
///
/// On failure before any durable write, the caller recycles the batch
/// items into the next session.
#[async_trait]
pub trait Updater: Send + Sync {
    async fn commit(&self, batch: UploadBatch) -> Result<Timestamp>;
}

/// Durable record of unsent items, consulted at the start of every
/// non-download-only session and rewritten by the [`Updater`].
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn load(&self) -> Result<Vec<SyncItem>>;
}
