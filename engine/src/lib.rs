//! # Ferry Engine
//!
//! The conflict-resolution pipeline core for Ferry, a client-side data
//! synchronization engine.
//!
//! This crate provides the pure logic half of the pipeline: the item data
//! model, the coalescing update queue, the conflict-rule value index, and
//! the conflict resolver that reconciles freshly downloaded items against
//! queued local changes. The async session/scheduling half lives in
//! `ferry-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of the network or storage
//! - **Deterministic**: the same queues and rules always resolve the same way
//! - **Value-like items**: items are cloned across ownership boundaries so
//!   queued state and in-flight state can never alias
//!
//! ## Core Concepts
//!
//! ### Sync Items
//!
//! One [`SyncItem`] describes one change to one logical entity, identified
//! by its *lookup key* (`componentId/itemId[/typeId]`). Items carry an open
//! string-keyed property map plus removal and encryption flags.
//!
//! ### Update Queues
//!
//! An [`UpdateQueue`] is an insertion-ordered map from lookup key to item.
//! Inserting a key that is already present *smooshes* the new item onto the
//! old one instead of duplicating it: later property writes win, and a
//! removal replaces prior properties outright.
//!
//! ### Conflict Rules
//!
//! A [`ConflictRule`] names a subset of properties whose concatenated value
//! must be unique across entities (e.g. "no two folders named `Work`"). The
//! rule maintains a reverse index from conflict value to the lookup key
//! currently holding it.
//!
//! ### Conflict Resolution
//!
//! The [`ConflictResolver`] owns a session's two queues (to-server and
//! apply-locally) and a per-session snapshot of every registered rule. It
//! detects collisions through the rule indexes and delegates the resolution
//! policy to the owning [`ComponentAdapter`]. Resolution is iterative:
//! resolving one conflict can produce items that must themselves be
//! resolved.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{SyncItem, UpdateQueue};
//!
//! let mut queue = UpdateQueue::new();
//!
//! let mut first = SyncItem::new("bookmarks", "bm-1");
//! first.set_property("title", "Rust");
//! queue.add_item(first);
//!
//! let mut second = SyncItem::new("bookmarks", "bm-1");
//! second.set_property("url", "https://rust-lang.org");
//! queue.add_item(second);
//!
//! // Same lookup key, so the two updates coalesced into one entry.
//! assert_eq!(queue.pending_size(), 1);
//! let merged = queue.item("bookmarks/bm-1").unwrap();
//! assert_eq!(merged.property("title"), Some("Rust"));
//! assert_eq!(merged.property("url"), Some("https://rust-lang.org"));
//! ```

pub mod adapter;
pub mod error;
pub mod item;
pub mod queue;
pub mod resolver;
pub mod rule;

// Re-export main types at crate root
pub use adapter::{ComponentAdapter, SyncBehavior};
pub use error::Error;
pub use item::SyncItem;
pub use queue::UpdateQueue;
pub use resolver::ConflictResolver;
pub use rule::ConflictRule;

/// Type aliases for clarity
pub type ComponentId = String;
pub type ItemId = String;
pub type TypeId = String;
pub type LookupKey = String;
pub type Timestamp = u64;
pub type Priority = i32;
