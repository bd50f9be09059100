//! # Stash Engine
//!
//! A local-first reactive data store with conflict-aware sync.
//!
//! Applications declare a schema, create and edit immutable models locally,
//! and observe changes live. When a [`sync::Transport`] is configured, local
//! mutations are queued and pushed to the remote service while remote records
//! are pulled and merged back.
//!
//! ## Core Concepts
//!
//! ### Models
//!
//! A [`Schema`] becomes a [`Registry`] of [`ModelConstructor`]s. Constructors
//! validate every field and return frozen [`Model`] values:
//! - [`ModelConstructor::create`] - Build from a JSON object
//! - [`ModelConstructor::copy_of`] - Edit a copy, producing [`Patch`]es
//!
//! ### Storage
//!
//! [`storage::Storage`] runs saves, cascading deletes and queries against a
//! [`storage::StorageAdapter`]. Every change is published as a
//! [`MutationEvent`].
//!
//! ### Observation
//!
//! - [`DataStore::observe`] - Raw mutation events
//! - [`DataStore::observe_query`] - Cumulative [`observe::Snapshot`]s of a query
//!
//! ### Sync
//!
//! The [`sync`] module retries remote requests with jittered backoff,
//! classifies failures and merges remote records without overwriting pending
//! local work.
//!
//! ## Quick Start
//!
//! ```rust
//! use stash_engine::storage::{InMemoryAdapter, Pagination};
//! use stash_engine::{DataStore, FieldDef, FieldType, ModelDefinition, Predicate, Schema};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), stash_engine::Error> {
//! // 1. Define a schema
//! let schema = Schema::new("1").with_model(ModelDefinition::new(
//!     "Post",
//!     vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("rating", FieldType::Int),
//!     ],
//! ));
//!
//! // 2. Create and start a store
//! let store = DataStore::new(Arc::new(InMemoryAdapter::new()));
//! let registry = store.init_schema(schema)?;
//! store.start().await?;
//!
//! // 3. Save models
//! let posts = registry.model("Post").unwrap();
//! let post = posts.create(json!({"title": "Hello", "rating": 5}))?;
//! store.save(&post).await?;
//!
//! let (edited, _patches) = posts.copy_of(&post, |draft| {
//!     draft.set("rating", 4);
//! })?;
//! store.save(&edited).await?;
//!
//! // 4. Query
//! let found = store
//!     .query(&posts, Some(Predicate::field("rating").lt(5)), Pagination::new())
//!     .await?;
//! assert_eq!(found.len(), 1);
//! assert_eq!(found[0].id(), post.id());
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`storage::InMemoryAdapter::with_persistence`] writes a versioned
//! [`storage::StoreSnapshot`] after every change. Snapshots are JSON with
//! deterministic ordering.

pub mod config;
pub mod datastore;
pub mod error;
pub mod model;
pub mod mutation;
pub mod observe;
pub mod patch;
pub mod predicate;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod validate;

// Re-export main types at crate root
pub use config::{ConfigError, DataStoreConfig};
pub use datastore::{Criteria, DataStore, DeleteTarget};
pub use error::{Error, Result};
pub use model::{Draft, Model, ModelConstructor, NonModel, NonModelConstructor, Registry};
pub use mutation::{MutationEvent, MutationFeed, MutationFilter, OpType, Origin, Subscription};
pub use observe::{ObserveQueryOptions, QuerySubscription, Snapshot, SyncStatus};
pub use patch::{Patch, PatchOp};
pub use predicate::{Operator, Predicate, Sort, SortDirection};
pub use schema::{Association, FieldDef, FieldType, ModelDefinition, NonModelDefinition, Schema};

/// Type aliases for clarity
pub type ModelName = String;
pub type ModelId = String;
