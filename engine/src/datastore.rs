//! The [`DataStore`] facade and its lifecycle.
//!
//! A store goes through `init_schema → start → (stop | clear)`. Every data
//! operation requires a started store and fails with
//! [`Error::SchemaNotInitialized`] otherwise. Instances are independent, so
//! tests can run several side by side.

use crate::config::DataStoreConfig;
use crate::mutation::{MutationFeed, MutationFilter, Subscription};
use crate::observe::{self, ObserveQueryOptions, QuerySubscription, SyncStatus};
use crate::storage::{ExclusiveStorage, Pagination, Storage, StorageAdapter};
use crate::sync::{Hub, HubEvent, SyncEngine, SyncHandle, SyncLimits, SyncProcessor, Transport};
use crate::{error::Result, Error, Model, ModelConstructor, Predicate, Registry, Schema};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a delete applies to.
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// Every record of a type matching the criteria
    Type(ModelConstructor),
    /// One record
    Instance(Model),
}

impl From<ModelConstructor> for DeleteTarget {
    fn from(ctor: ModelConstructor) -> Self {
        DeleteTarget::Type(ctor)
    }
}

impl From<Model> for DeleteTarget {
    fn from(model: Model) -> Self {
        DeleteTarget::Instance(model)
    }
}

/// An id or a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    Id(String),
    Predicate(Predicate),
}

impl From<Predicate> for Criteria {
    fn from(predicate: Predicate) -> Self {
        Criteria::Predicate(predicate)
    }
}

impl From<&str> for Criteria {
    fn from(id: &str) -> Self {
        Criteria::Id(id.to_string())
    }
}

/// State of a started store.
struct Running {
    storage: Arc<ExclusiveStorage>,
    feed: Arc<MutationFeed>,
    registry: Registry,
    config: DataStoreConfig,
    sync: Option<(Arc<SyncEngine>, SyncHandle)>,
}

struct Inner {
    adapter: Arc<dyn StorageAdapter>,
    transport: Option<Arc<dyn Transport>>,
    config: RwLock<DataStoreConfig>,
    registry: RwLock<Option<Registry>>,
    running: RwLock<Option<Arc<Running>>>,
    /// Serializes start, stop and clear
    lifecycle: Mutex<()>,
    hub: Hub,
    status: Arc<SyncStatus>,
}

/// Local-first data store.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<Inner>,
}

impl DataStore {
    /// A store without remote sync.
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self::build(adapter, None)
    }

    /// A store syncing through `transport`.
    pub fn with_transport(adapter: Arc<dyn StorageAdapter>, transport: Arc<dyn Transport>) -> Self {
        Self::build(adapter, Some(transport))
    }

    fn build(adapter: Arc<dyn StorageAdapter>, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                transport,
                config: RwLock::new(DataStoreConfig::default()),
                registry: RwLock::new(None),
                running: RwLock::new(None),
                lifecycle: Mutex::new(()),
                hub: Hub::default(),
                status: Arc::new(SyncStatus::new()),
            }),
        }
    }

    /// Replace the configuration. Takes effect on the next [`DataStore::start`].
    pub fn configure(&self, config: DataStoreConfig) {
        tracing::debug!(?config, "datastore configured");
        *self.inner.config.write() = config;
    }

    /// Build the model registry. Only the first call has an effect.
    pub fn init_schema(&self, schema: Schema) -> Result<Registry> {
        let mut slot = self.inner.registry.write();
        if let Some(existing) = slot.as_ref() {
            tracing::warn!("The schema has already been initialized");
            return Ok(existing.clone());
        }
        let registry = Registry::from_schema(schema)?;
        tracing::info!(models = registry.models().count(), "schema initialized");
        *slot = Some(registry.clone());
        Ok(registry)
    }

    pub fn registry(&self) -> Option<Registry> {
        self.inner.registry.read().clone()
    }

    pub fn hub(&self) -> Hub {
        self.inner.hub.clone()
    }

    pub fn sync_status(&self) -> Arc<SyncStatus> {
        self.inner.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.read().is_some()
    }

    /// Local mutations not yet confirmed by the remote service.
    pub fn pending_mutations(&self) -> usize {
        self.inner
            .running
            .read()
            .as_ref()
            .and_then(|r| r.sync.as_ref())
            .map_or(0, |(engine, _)| engine.outbox().len())
    }

    fn running(&self) -> Result<Arc<Running>> {
        self.inner.running.read().clone().ok_or_else(|| {
            tracing::warn!("operation rejected, datastore is not started");
            Error::SchemaNotInitialized
        })
    }

    /// Open storage and start syncing. Calling it on a started store is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let registry = self.registry().ok_or(Error::SchemaNotInitialized)?;
        let config = self.inner.config.read().clone();

        let feed = MutationFeed::new_shared();
        let storage = Arc::new(ExclusiveStorage::new(Storage::new(
            self.inner.adapter.clone(),
            registry.clone(),
            feed.clone(),
        )));
        storage.init().await?;

        let syncing = self.inner.transport.is_some();
        for ctor in registry.models() {
            if syncing && ctor.is_syncable() {
                self.inner.status.mark_unsynced(ctor.name());
            } else {
                self.inner.status.mark_synced(ctor.name());
            }
        }

        let sync = match &self.inner.transport {
            Some(transport) => {
                let processor = SyncProcessor::new(
                    transport.clone(),
                    self.inner.hub.clone(),
                    config.error_handler.clone(),
                    config.retry.clone(),
                )
                .with_partial_data(config.partial_data)
                .with_auth(config.auth_mode, config.auth_strategy.clone());

                let engine = Arc::new(SyncEngine::new(
                    storage.clone(),
                    Arc::new(processor),
                    self.inner.hub.clone(),
                    self.inner.status.clone(),
                    config.error_handler.clone(),
                    SyncLimits {
                        page_size: config.sync_page_size,
                        max_records: config.max_records_to_sync,
                    },
                )
                .with_pull_retry(config.retry.clone()));
                let handle = engine.clone().start();
                Some((engine, handle))
            }
            None => {
                self.inner.hub.dispatch(HubEvent::Ready);
                None
            }
        };

        *self.inner.running.write() = Some(Arc::new(Running {
            storage,
            feed,
            registry,
            config,
            sync,
        }));

        tracing::info!(syncing, "datastore started");
        Ok(())
    }

    /// Stop syncing and end every subscription.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.shutdown();
    }

    fn shutdown(&self) {
        let Some(running) = self.inner.running.write().take() else {
            return;
        };
        if let Some((_, handle)) = &running.sync {
            handle.abort();
        }
        running.feed.close();
        tracing::info!("datastore stopped");
    }

    /// Delete all local data and stop the store.
    pub async fn clear(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.registry().is_none() {
            return Err(Error::SchemaNotInitialized);
        }

        let running = self.inner.running.read().clone();
        match running {
            Some(running) => {
                running.storage.clear().await?;
                if let Some((engine, _)) = &running.sync {
                    engine.outbox().clear();
                }
            }
            None => {
                self.inner.adapter.init().await?;
                self.inner.adapter.clear().await?;
            }
        }

        self.shutdown();
        tracing::info!("datastore cleared");
        Ok(())
    }

    fn constructor(running: &Running, ctor: &ModelConstructor) -> Result<()> {
        if running.registry.contains(ctor) {
            Ok(())
        } else {
            Err(Error::InvalidModelConstructor)
        }
    }

    /// Insert or update a model.
    pub async fn save(&self, model: &Model) -> Result<Model> {
        self.save_with_condition(model, None).await
    }

    /// Save only if the stored record matches `condition`.
    pub async fn save_with_condition(&self, model: &Model, condition: Option<&Predicate>) -> Result<Model> {
        let running = self.running()?;
        let ctor = running
            .registry
            .model(model.model_name())
            .ok_or(Error::NotAModel)?;
        if let Some(condition) = condition {
            condition.validate(ctor.definition())?;
        }

        running.storage.save(model, condition).await?;
        Ok(model.clone())
    }

    /// Delete one model or every model of a type matching the criteria.
    ///
    /// Returns the deleted models, cascades included.
    pub async fn delete(&self, target: Option<DeleteTarget>, criteria: Option<Criteria>) -> Result<Vec<Model>> {
        let running = self.running()?;

        match target.ok_or(Error::ModelRequired)? {
            DeleteTarget::Type(ctor) => {
                Self::constructor(&running, &ctor)?;
                match criteria.ok_or(Error::DeleteCriteriaRequired)? {
                    Criteria::Id(id) => match running.storage.query_by_id(&ctor, &id).await? {
                        Some(model) => running.storage.delete(&model, None).await,
                        None => Ok(Vec::new()),
                    },
                    Criteria::Predicate(predicate) => {
                        if is_empty_group(&predicate) {
                            return Err(Error::EmptyCriteria);
                        }
                        predicate.validate(ctor.definition())?;
                        running.storage.delete_matching(&ctor, &predicate).await
                    }
                }
            }
            DeleteTarget::Instance(model) => {
                let ctor = running
                    .registry
                    .model(model.model_name())
                    .ok_or(Error::NotAModel)?;
                let condition = match criteria {
                    None => None,
                    Some(Criteria::Id(_)) => return Err(Error::InvalidCriteria),
                    Some(Criteria::Predicate(predicate)) => {
                        predicate.validate(ctor.definition())?;
                        Some(predicate).filter(|p| !p.is_all())
                    }
                };
                running.storage.delete(&model, condition.as_ref()).await
            }
        }
    }

    /// Query models of one type.
    pub async fn query(
        &self,
        ctor: &ModelConstructor,
        predicate: Option<Predicate>,
        pagination: Pagination,
    ) -> Result<Vec<Model>> {
        let running = self.running()?;
        Self::constructor(&running, ctor)?;
        pagination.validate()?;
        if let Some(predicate) = &predicate {
            predicate.validate(ctor.definition())?;
        }

        running
            .storage
            .query(ctor, predicate.as_ref(), &pagination)
            .await
    }

    pub async fn query_by_id(&self, ctor: &ModelConstructor, id: &str) -> Result<Option<Model>> {
        let running = self.running()?;
        Self::constructor(&running, ctor)?;
        running.storage.query_by_id(ctor, id).await
    }

    /// Subscribe to mutation events, optionally narrowed to a type and an
    /// id or predicate.
    pub fn observe(&self, ctor: Option<&ModelConstructor>, criteria: Option<Criteria>) -> Result<Subscription> {
        if ctor.is_none() && criteria.is_some() {
            return Err(Error::CriteriaWithoutModel);
        }
        let running = self.running()?;

        let filter = match ctor {
            None => MutationFilter::all(),
            Some(ctor) => {
                Self::constructor(&running, ctor)?;
                let filter = MutationFilter::model(ctor.name());
                match criteria {
                    None => filter,
                    Some(Criteria::Id(id)) => filter.with_id(id),
                    Some(Criteria::Predicate(predicate)) => {
                        predicate.validate(ctor.definition())?;
                        filter.with_predicate(predicate)
                    }
                }
            }
        };

        Ok(observe::observe(&running.feed, filter))
    }

    /// Subscribe to the live result set of a query.
    pub fn observe_query(
        &self,
        ctor: &ModelConstructor,
        predicate: Option<Predicate>,
        options: Option<ObserveQueryOptions>,
    ) -> Result<QuerySubscription> {
        let running = self.running()?;
        Self::constructor(&running, ctor)?;
        if let Some(predicate) = &predicate {
            predicate.validate(ctor.definition())?;
        }

        let options = options.unwrap_or_else(|| ObserveQueryOptions {
            sort: None,
            sync_page_size: running.config.sync_page_size,
            throttle: running.config.observe_query_throttle,
        });

        Ok(observe::observe_query(
            running.storage.storage().clone(),
            &self.inner.status,
            ctor.clone(),
            predicate,
            options,
        ))
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("running", &self.is_running())
            .field("syncing", &self.inner.transport.is_some())
            .finish_non_exhaustive()
    }
}

fn is_empty_group(predicate: &Predicate) -> bool {
    matches!(
        predicate,
        Predicate::And { predicates } | Predicate::Or { predicates } if predicates.is_empty()
    )
}
