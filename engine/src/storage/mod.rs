//! Storage engine.
//!
//! [`Storage`] turns model operations into adapter calls: it checks save
//! conditions, saves attached related models, cascades deletes, picks a query
//! strategy, hydrates relations and publishes one [`MutationEvent`] per
//! change. [`ExclusiveStorage`] serializes every mutating call behind one
//! async lock.

pub mod adapter;
pub mod memory;
pub mod snapshot;

pub use adapter::StorageAdapter;
pub use memory::InMemoryAdapter;
pub use snapshot::{SnapshotRow, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};

use crate::mutation::{MutationEvent, MutationFeed, OpType, Origin};
use crate::{
    error::Result, Association, Error, Model, ModelConstructor, ModelDefinition, Predicate,
    Registry, Sort,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Reserved model holding store settings.
pub const SETTINGS_MODEL: &str = "__Setting";
const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// How a query is executed against the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Point lookup by id
    ById,
    /// Pagination pushed down to the adapter
    EnginePagination,
    /// Full scan, then filter, sort and paginate in memory
    InMemory,
    /// Full scan
    All,
}

/// Pagination and sort options of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pagination {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Sort,
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Parse `{page, limit}` from loosely typed input.
    pub fn from_value(value: &Value) -> Result<Self> {
        let page = value.get("page").filter(|v| !v.is_null());
        let limit = value.get("limit").filter(|v| !v.is_null());

        if page.is_some() && limit.is_none() {
            return Err(Error::LimitRequired);
        }
        let page = page
            .map(|p| integer(p).ok_or(Error::PageNotANumber))
            .transpose()?;
        if page.is_some_and(|p| p < 0) {
            return Err(Error::NegativePage);
        }
        let limit = limit
            .map(|l| integer(l).ok_or(Error::LimitNotANumber))
            .transpose()?;

        let pagination = Self {
            page,
            limit,
            sort: Sort::default(),
        };
        pagination.validate()?;
        Ok(pagination)
    }

    /// Check page and limit, returning `(page, limit)` for slicing.
    pub fn validate(&self) -> Result<(usize, Option<usize>)> {
        if self.page.is_some() && self.limit.is_none() {
            return Err(Error::LimitRequired);
        }
        if self.page.is_some_and(|p| p < 0) {
            return Err(Error::NegativePage);
        }
        if self.limit.is_some_and(|l| l < 0) {
            return Err(Error::NegativeLimit);
        }
        let page = self.page.unwrap_or(0) as usize;
        let limit = self.limit.map(|l| l as usize);
        Ok((page, limit))
    }
}

fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

/// Pick the query strategy for a request shape.
pub fn select_strategy(predicate: Option<&Predicate>, pagination: &Pagination) -> QueryStrategy {
    let predicate = predicate.filter(|p| !p.is_all());
    match predicate {
        Some(p) if p.as_id_lookup().is_some() => QueryStrategy::ById,
        Some(_) => QueryStrategy::InMemory,
        None if !pagination.sort.is_empty() => QueryStrategy::InMemory,
        None if pagination.limit.is_some() => QueryStrategy::EnginePagination,
        None => QueryStrategy::All,
    }
}

/// Model operations over an adapter. Not synchronized; see [`ExclusiveStorage`].
pub struct Storage {
    adapter: Arc<dyn StorageAdapter>,
    registry: Registry,
    feed: Arc<MutationFeed>,
}

impl Storage {
    pub fn new(adapter: Arc<dyn StorageAdapter>, registry: Registry, feed: Arc<MutationFeed>) -> Self {
        Self {
            adapter,
            registry,
            feed,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn feed(&self) -> &Arc<MutationFeed> {
        &self.feed
    }

    /// Prepare the adapter and wipe local data when the schema version changed.
    pub async fn init(&self) -> Result<()> {
        self.adapter.init().await?;

        let version = &self.registry.schema().version;
        let stored = self.adapter.get(SETTINGS_MODEL, SCHEMA_VERSION_KEY).await?;
        let stored_version = stored
            .as_ref()
            .and_then(|s| s.get("value"))
            .and_then(Value::as_str);

        match stored_version {
            Some(v) if v == version => return Ok(()),
            Some(v) => {
                tracing::info!(from = %v, to = %version, "schema version changed, clearing local data");
                self.adapter.clear().await?;
            }
            None => {}
        }

        self.adapter
            .put(
                SETTINGS_MODEL,
                SCHEMA_VERSION_KEY,
                json!({"id": SCHEMA_VERSION_KEY, "key": SCHEMA_VERSION_KEY, "value": version}),
            )
            .await
    }

    /// Stored schema version setting.
    pub async fn schema_version(&self) -> Result<Option<String>> {
        let stored = self.adapter.get(SETTINGS_MODEL, SCHEMA_VERSION_KEY).await?;
        Ok(stored
            .and_then(|s| s.get("value").cloned())
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    fn constructor(&self, model: &str) -> Result<ModelConstructor> {
        self.registry.model(model).ok_or(Error::NotAModel)
    }

    async fn load(&self, ctor: &ModelConstructor, id: &str) -> Result<Option<Model>> {
        match self.adapter.get(ctor.name(), id).await? {
            Some(record) => Ok(Some(ctor.restore(&record)?)),
            None => Ok(None),
        }
    }

    /// Insert or update a model.
    ///
    /// Related models attached to `model` that are not stored yet are inserted
    /// first. Returns every saved model with its operation kind, dependents
    /// first.
    pub async fn save(
        &self,
        model: &Model,
        condition: Option<&Predicate>,
        origin: Origin,
    ) -> Result<Vec<(Model, OpType)>> {
        let ctor = self.constructor(model.model_name())?;
        let existing = self.load(&ctor, model.id()).await?;

        if let (Some(condition), Some(existing)) = (condition, &existing) {
            if !condition.matches(existing) {
                return Err(Error::ConditionFailed);
            }
        }

        let mut saved = Vec::new();

        for (_, related) in model.related_models() {
            let related_ctor = self.constructor(related.model_name())?;
            if self.load(&related_ctor, related.id()).await?.is_none() {
                self.adapter
                    .put(related.model_name(), related.id(), related.to_json())
                    .await?;
                self.feed
                    .publish(&MutationEvent::new(OpType::Insert, related.clone(), origin));
                saved.push((related.clone(), OpType::Insert));
            }
        }

        self.adapter
            .put(model.model_name(), model.id(), model.to_json())
            .await?;

        let event = match existing {
            None => MutationEvent::new(OpType::Insert, model.clone(), origin),
            Some(_) => MutationEvent::new(OpType::Update, model.clone(), origin)
                .with_patches(model.patches().to_vec()),
        };
        let event = event.with_condition(condition.cloned());
        self.feed.publish(&event);

        tracing::debug!(
            model = %model.model_name(),
            id = %model.id(),
            op = ?event.op_type,
            "saved"
        );

        saved.push((model.clone(), event.op_type));
        Ok(saved)
    }

    /// Delete one model and everything it owns.
    ///
    /// Returns the deleted models, owner first. A missing model deletes nothing.
    pub async fn delete(
        &self,
        model: &Model,
        condition: Option<&Predicate>,
        origin: Origin,
    ) -> Result<Vec<Model>> {
        let ctor = self.constructor(model.model_name())?;
        let Some(existing) = self.load(&ctor, model.id()).await? else {
            return Ok(Vec::new());
        };

        if let Some(condition) = condition {
            if !condition.matches(&existing) {
                return Err(Error::ConditionFailed);
            }
        }

        let mut deleted = Vec::new();
        let mut visited = HashSet::new();
        let mut children = ChildIndex::default();
        self.cascade(existing, condition, origin, &mut visited, &mut children, &mut deleted)
            .await?;
        Ok(deleted)
    }

    /// Delete every model of a type matching `predicate`, with cascades.
    pub async fn delete_matching(
        &self,
        ctor: &ModelConstructor,
        predicate: &Predicate,
        origin: Origin,
    ) -> Result<Vec<Model>> {
        let mut deleted = Vec::new();
        let mut visited = HashSet::new();
        let mut children = ChildIndex::default();

        for record in self.adapter.get_all(ctor.name()).await? {
            let model = ctor.restore(&record)?;
            if predicate.matches(&model) {
                self.cascade(
                    model,
                    Some(predicate),
                    origin,
                    &mut visited,
                    &mut children,
                    &mut deleted,
                )
                .await?;
            }
        }
        Ok(deleted)
    }

    async fn cascade(
        &self,
        root: Model,
        condition: Option<&Predicate>,
        origin: Origin,
        visited: &mut HashSet<(String, String)>,
        children: &mut ChildIndex,
        deleted: &mut Vec<Model>,
    ) -> Result<()> {
        let mut queue = vec![(root, condition.cloned())];

        while let Some((model, condition)) = queue.pop() {
            let key = (model.model_name().to_string(), model.id().to_string());
            if !visited.insert(key) {
                continue;
            }

            let ctor = self.constructor(model.model_name())?;
            let dependents = self.dependents(ctor.definition(), &model, children).await?;

            self.adapter.remove(model.model_name(), model.id()).await?;
            self.feed.publish(
                &MutationEvent::new(OpType::Delete, model.clone(), origin).with_condition(condition),
            );
            tracing::debug!(model = %model.model_name(), id = %model.id(), "deleted");
            deleted.push(model);

            // reversed so the first dependent is processed first
            queue.extend(dependents.into_iter().rev().map(|m| (m, None)));
        }
        Ok(())
    }

    /// Records owned by `model` through hasOne/hasMany relations.
    async fn dependents(
        &self,
        definition: &ModelDefinition,
        model: &Model,
        children: &mut ChildIndex,
    ) -> Result<Vec<Model>> {
        let mut out = Vec::new();

        for field in definition.relations() {
            let Some(related_name) = field.related_model() else {
                continue;
            };
            let related_ctor = self.constructor(related_name)?;

            match &field.association {
                Association::HasOne {
                    target_name: Some(key),
                    ..
                } => {
                    if let Some(id) = model.get_str(key) {
                        out.extend(self.load(&related_ctor, id).await?);
                    }
                }
                Association::HasOne {
                    associated_with,
                    target_name: None,
                }
                | Association::HasMany { associated_with } => {
                    let key = child_key(related_ctor.definition(), associated_with);
                    for record in children
                        .owned_by(self.adapter.as_ref(), related_name, &key, model.id())
                        .await?
                    {
                        out.push(related_ctor.restore(record)?);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// Query models.
    pub async fn query(
        &self,
        ctor: &ModelConstructor,
        predicate: Option<&Predicate>,
        pagination: &Pagination,
    ) -> Result<Vec<Model>> {
        let (page, limit) = pagination.validate()?;
        let strategy = select_strategy(predicate, pagination);
        tracing::trace!(model = %ctor.name(), ?strategy, "query strategy selected");

        let models = match strategy {
            QueryStrategy::ById => {
                let id = predicate.and_then(Predicate::as_id_lookup).unwrap_or_default();
                self.load(ctor, id).await?.into_iter().collect()
            }
            QueryStrategy::EnginePagination => {
                let limit = limit.unwrap_or(usize::MAX);
                self.adapter
                    .get_page(ctor.name(), page, limit)
                    .await?
                    .iter()
                    .map(|r| ctor.restore(r))
                    .collect::<Result<Vec<_>>>()?
            }
            QueryStrategy::InMemory => {
                let mut models = self
                    .adapter
                    .get_all(ctor.name())
                    .await?
                    .iter()
                    .map(|r| ctor.restore(r))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(predicate) = predicate {
                    models.retain(|m| predicate.matches(m));
                }
                pagination.sort.apply(&mut models);
                match limit {
                    Some(limit) => models
                        .into_iter()
                        .skip(page.saturating_mul(limit))
                        .take(limit)
                        .collect(),
                    None => models,
                }
            }
            QueryStrategy::All => self
                .adapter
                .get_all(ctor.name())
                .await?
                .iter()
                .map(|r| ctor.restore(r))
                .collect::<Result<Vec<_>>>()?,
        };

        let mut children = ChildIndex::default();
        let mut hydrated = Vec::with_capacity(models.len());
        for model in models {
            hydrated.push(self.hydrate_with(model, &mut children).await?);
        }
        Ok(hydrated)
    }

    /// Point lookup, hydrated.
    pub async fn query_by_id(&self, ctor: &ModelConstructor, id: &str) -> Result<Option<Model>> {
        match self.load(ctor, id).await? {
            Some(model) => Ok(Some(self.hydrate(model).await?)),
            None => Ok(None),
        }
    }

    /// Resolve belongsTo/hasOne relations one level deep.
    pub async fn hydrate(&self, model: Model) -> Result<Model> {
        self.hydrate_with(model, &mut ChildIndex::default()).await
    }

    async fn hydrate_with(&self, model: Model, children: &mut ChildIndex) -> Result<Model> {
        let ctor = self.constructor(model.model_name())?;
        let mut related = BTreeMap::new();

        for field in ctor.definition().relations() {
            let Some(related_name) = field.related_model() else {
                continue;
            };
            let related_ctor = self.constructor(related_name)?;

            let found = match &field.association {
                Association::BelongsTo { target_name }
                | Association::HasOne {
                    target_name: Some(target_name),
                    ..
                } => match model.get_str(target_name) {
                    Some(id) => self.load(&related_ctor, id).await?,
                    None => None,
                },
                Association::HasOne {
                    associated_with,
                    target_name: None,
                } => {
                    let key = child_key(related_ctor.definition(), associated_with);
                    match children
                        .owned_by(self.adapter.as_ref(), related_name, &key, model.id())
                        .await?
                        .first()
                    {
                        Some(record) => Some(related_ctor.restore(record)?),
                        None => None,
                    }
                }
                _ => None,
            };

            if let Some(found) = found {
                related.insert(field.name.clone(), found);
            }
        }

        Ok(model.with_related(related))
    }

    /// Remove every record.
    pub async fn clear(&self) -> Result<()> {
        self.adapter.clear().await
    }
}

/// Child records grouped by owner id, loaded once per table and key for the
/// length of one batch operation.
#[derive(Default)]
struct ChildIndex {
    groups: HashMap<(String, String), HashMap<String, Vec<Value>>>,
}

impl ChildIndex {
    /// Records of `model` whose `key` field holds `owner`, in insertion order.
    async fn owned_by(
        &mut self,
        adapter: &dyn StorageAdapter,
        model: &str,
        key: &str,
        owner: &str,
    ) -> Result<&[Value]> {
        let slot = (model.to_string(), key.to_string());
        if !self.groups.contains_key(&slot) {
            let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
            for record in adapter.get_all(model).await? {
                if let Some(owner) = record.get(key).and_then(Value::as_str).map(str::to_string) {
                    groups.entry(owner).or_default().push(record);
                }
            }
            self.groups.insert(slot.clone(), groups);
        }

        Ok(self
            .groups
            .get(&slot)
            .and_then(|groups| groups.get(owner))
            .map(Vec::as_slice)
            .unwrap_or_default())
    }
}

/// Field on the child that stores the owner's id.
fn child_key(child: &ModelDefinition, associated_with: &str) -> String {
    child
        .field(associated_with)
        .and_then(|f| f.association.local_key())
        .unwrap_or(associated_with)
        .to_string()
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

/// [`Storage`] behind a mutual-exclusion lock.
#[derive(Debug)]
pub struct ExclusiveStorage {
    storage: Arc<Storage>,
    lock: Mutex<()>,
}

impl ExclusiveStorage {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Arc::new(storage),
            lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Run `f` while no other exclusive block or mutation runs.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Storage>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock.lock().await;
        f(self.storage.clone()).await
    }

    pub async fn init(&self) -> Result<()> {
        self.run_exclusive(|s| async move { s.init().await }).await
    }

    pub async fn save(&self, model: &Model, condition: Option<&Predicate>) -> Result<Vec<(Model, OpType)>> {
        self.run_exclusive(|s| async move { s.save(model, condition, Origin::Local).await })
            .await
    }

    pub async fn delete(&self, model: &Model, condition: Option<&Predicate>) -> Result<Vec<Model>> {
        self.run_exclusive(|s| async move { s.delete(model, condition, Origin::Local).await })
            .await
    }

    pub async fn delete_matching(&self, ctor: &ModelConstructor, predicate: &Predicate) -> Result<Vec<Model>> {
        self.run_exclusive(|s| async move { s.delete_matching(ctor, predicate, Origin::Local).await })
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.run_exclusive(|s| async move { s.clear().await }).await
    }

    /// Queries do not take the lock.
    pub async fn query(
        &self,
        ctor: &ModelConstructor,
        predicate: Option<&Predicate>,
        pagination: &Pagination,
    ) -> Result<Vec<Model>> {
        self.storage.query(ctor, predicate, pagination).await
    }

    pub async fn query_by_id(&self, ctor: &ModelConstructor, id: &str) -> Result<Option<Model>> {
        self.storage.query_by_id(ctor, id).await
    }
}
