//! Model instances and the registry of constructors derived from a schema.
//!
//! A [`ModelConstructor`] closes over one model definition and is the only way
//! to produce a [`Model`]. Models are frozen: the only way to change one is
//! [`ModelConstructor::copy_of`], which returns a new value plus the patches
//! describing the change.

use crate::patch::{self, Patch};
use crate::validate::validate_fields;
use crate::{error::Result, Error, ModelDefinition, ModelId, ModelName, NonModelDefinition, Schema};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use ulid::Ulid;
use uuid::Uuid;

/// Sync metadata fields only remote records may carry.
pub const SYNC_METADATA_FIELDS: [&str; 3] = ["_version", "_lastChangedAt", "_deleted"];

/// An immutable model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    id: ModelId,
    model: ModelName,
    fields: Map<String, Value>,
    related: BTreeMap<String, Model>,
    patches: Vec<Patch>,
}

impl Model {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the model type.
    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == "id" {
            return None;
        }
        self.fields.get(field)
    }

    /// Get a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Related model attached to, or hydrated into, a relation field.
    pub fn related(&self, field: &str) -> Option<&Model> {
        self.related.get(field)
    }

    pub(crate) fn related_models(&self) -> impl Iterator<Item = (&String, &Model)> {
        self.related.iter()
    }

    /// Patches accumulated across every `copy_of` leading to this instance.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Server version, present on records received from sync.
    pub fn version(&self) -> Option<u64> {
        self.fields.get("_version").and_then(Value::as_u64)
    }

    /// Whether the record is a remote tombstone.
    pub fn is_deleted(&self) -> bool {
        self.fields
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Direct assignment always fails: models are frozen.
    pub fn assign(&self, field: &str, _value: impl Into<Value>) -> Result<()> {
        Err(Error::FrozenProperty(field.to_string()))
    }

    /// Record representation: `id` plus stored fields.
    pub fn to_json(&self) -> Value {
        let mut record = self.fields.clone();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(record)
    }

    /// Record representation including hydrated relations.
    pub fn to_json_hydrated(&self) -> Value {
        let mut record = self.fields.clone();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        for (field, model) in &self.related {
            record.insert(field.clone(), model.to_json());
        }
        Value::Object(record)
    }

    pub(crate) fn with_related(mut self, related: BTreeMap<String, Model>) -> Self {
        self.related = related;
        self
    }

    pub(crate) fn without_related(&self) -> Self {
        Self {
            related: BTreeMap::new(),
            ..self.clone()
        }
    }
}

/// Mutable view handed to `build`/`copy_of` mutators.
#[derive(Debug)]
pub struct Draft {
    definition: Arc<ModelDefinition>,
    fields: Map<String, Value>,
    related: BTreeMap<String, Model>,
    error: Option<Error>,
}

impl Draft {
    fn new(definition: Arc<ModelDefinition>) -> Self {
        Self {
            definition,
            fields: Map::new(),
            related: BTreeMap::new(),
            error: None,
        }
    }

    /// Set a field. Writes to `id` are ignored.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        if field != "id" {
            self.fields.insert(field.to_string(), value.into());
        }
        self
    }

    /// Remove a field.
    pub fn unset(&mut self, field: &str) -> &mut Self {
        self.fields.remove(field);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Attach a related model, writing its id into the relation's foreign key.
    pub fn set_related(&mut self, field: &str, model: &Model) -> &mut Self {
        let Some(def) = self.definition.field(field).filter(|f| f.is_relation()) else {
            self.error.get_or_insert(Error::NotARelation(field.to_string()));
            return self;
        };

        if def.related_model() != Some(model.model_name()) {
            self.error.get_or_insert(Error::TypeMismatch {
                field: field.to_string(),
                expected: def.field_type.to_string(),
                actual: model.model_name().to_string(),
                value: model.id().to_string(),
            });
            return self;
        }

        if let Some(key) = def.association.local_key() {
            self.fields
                .insert(key.to_string(), Value::String(model.id().to_string()));
        }
        self.related.insert(field.to_string(), model.without_related());
        self
    }
}

/// Constructor for one model type.
#[derive(Debug, Clone)]
pub struct ModelConstructor {
    definition: Arc<ModelDefinition>,
    schema: Arc<Schema>,
}

impl ModelConstructor {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn is_syncable(&self) -> bool {
        self.definition.syncable
    }

    /// Whether `model` was produced by this constructor's type.
    pub fn owns(&self, model: &Model) -> bool {
        model.model_name() == self.name()
    }

    /// Construct a model from a JSON object of initial field values.
    pub fn create(&self, init: Value) -> Result<Model> {
        let Value::Object(init) = init else {
            return Err(Error::NotAModel);
        };
        self.check_read_only(init.keys().map(String::as_str))?;

        let mut draft = Draft::new(self.definition.clone());
        draft.fields = init;
        self.finish(self.generate_id(), draft, Vec::new())
    }

    /// Construct a model through a mutator.
    pub fn build(&self, mutator: impl FnOnce(&mut Draft)) -> Result<Model> {
        let mut draft = Draft::new(self.definition.clone());
        mutator(&mut draft);
        if let Some(err) = draft.error.take() {
            return Err(err);
        }
        self.check_read_only(draft.fields.keys().map(String::as_str))?;
        self.finish(self.generate_id(), draft, Vec::new())
    }

    /// Produce a changed copy of `source`.
    ///
    /// Returns the new instance (carrying every patch accumulated along its
    /// copy lineage) and the patches of this copy alone.
    pub fn copy_of(
        &self,
        source: &Model,
        mutator: impl FnOnce(&mut Draft),
    ) -> Result<(Model, Vec<Patch>)> {
        if !self.owns(source) {
            return Err(Error::InvalidCopySource);
        }

        let mut draft = Draft::new(self.definition.clone());
        draft.fields = source.fields.clone();
        draft.related = source.related.clone();
        mutator(&mut draft);
        if let Some(err) = draft.error.take() {
            return Err(err);
        }

        let read_only = self
            .definition
            .fields
            .iter()
            .filter(|f| f.read_only)
            .map(|f| f.name.as_str())
            .chain(SYNC_METADATA_FIELDS);
        for field in read_only {
            if source.fields.get(field) != draft.fields.get(field) {
                return Err(Error::ReadOnlyField(field.to_string()));
            }
        }

        let changes = patch::diff(&source.fields, &draft.fields);
        let accumulated = patch::merge(&source.patches, &changes);
        let model = self.finish(source.id.clone(), draft, accumulated)?;
        Ok((model, changes))
    }

    /// Build a model from a record received from the remote service.
    ///
    /// Read-only fields and sync metadata are accepted; the record is still
    /// validated.
    pub(crate) fn from_remote(&self, record: &Value) -> Result<Model> {
        let (id, fields) = split_record(record)?;
        validate_fields(&self.schema, &self.definition.fields, &fields)?;
        Ok(self.assemble(id, fields))
    }

    /// Rebuild a model previously persisted by this crate.
    pub(crate) fn restore(&self, record: &Value) -> Result<Model> {
        let (id, fields) = split_record(record)?;
        Ok(self.assemble(id, fields))
    }

    fn assemble(&self, id: ModelId, fields: Map<String, Value>) -> Model {
        Model {
            id,
            model: self.definition.name.clone(),
            fields,
            related: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    fn check_read_only<'a>(&self, mut keys: impl Iterator<Item = &'a str>) -> Result<()> {
        let offending = keys.find(|key| {
            *key == "id"
                || SYNC_METADATA_FIELDS.contains(key)
                || self.definition.field(key).is_some_and(|f| f.read_only)
        });
        match offending {
            Some(field) => Err(Error::ReadOnlyField(field.to_string())),
            None => Ok(()),
        }
    }

    fn finish(&self, id: ModelId, draft: Draft, patches: Vec<Patch>) -> Result<Model> {
        validate_fields(&self.schema, &self.definition.fields, &draft.fields)?;
        Ok(Model {
            id,
            model: self.definition.name.clone(),
            fields: draft.fields,
            related: draft.related,
            patches,
        })
    }

    fn generate_id(&self) -> ModelId {
        if self.definition.syncable {
            Uuid::new_v4().to_string()
        } else {
            Ulid::new().to_string()
        }
    }
}

fn split_record(record: &Value) -> Result<(ModelId, Map<String, Value>)> {
    let Value::Object(map) = record else {
        return Err(Error::NotAModel);
    };
    let mut fields = map.clone();
    let id = match fields.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(Error::NotAModel),
    };
    Ok((id, fields))
}

/// A validated nested value without identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NonModel {
    type_name: String,
    fields: Map<String, Value>,
}

impl NonModel {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Direct assignment always fails: values are frozen.
    pub fn assign(&self, field: &str, _value: impl Into<Value>) -> Result<()> {
        Err(Error::FrozenProperty(field.to_string()))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl From<NonModel> for Value {
    fn from(value: NonModel) -> Self {
        Value::Object(value.fields)
    }
}

/// Constructor for one non-model type.
#[derive(Debug, Clone)]
pub struct NonModelConstructor {
    definition: Arc<NonModelDefinition>,
    schema: Arc<Schema>,
}

impl NonModelConstructor {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn create(&self, init: Value) -> Result<NonModel> {
        let Value::Object(fields) = init else {
            return Err(Error::TypeMismatch {
                field: self.definition.name.clone(),
                expected: "object".to_string(),
                actual: crate::validate::js_type(&init).to_string(),
                value: crate::validate::display(&init),
            });
        };
        validate_fields(&self.schema, &self.definition.fields, &fields)?;
        Ok(NonModel {
            type_name: self.definition.name.clone(),
            fields,
        })
    }
}

/// Constructors for every type declared in a schema.
#[derive(Debug, Clone)]
pub struct Registry {
    schema: Arc<Schema>,
    models: BTreeMap<ModelName, ModelConstructor>,
    non_models: BTreeMap<String, NonModelConstructor>,
}

impl Registry {
    /// Build one constructor per model and non-model type.
    pub fn from_schema(schema: Schema) -> Result<Self> {
        schema.check_references()?;
        let schema = Arc::new(schema);

        let models = schema
            .models
            .values()
            .map(|def| {
                let ctor = ModelConstructor {
                    definition: Arc::new(def.clone()),
                    schema: schema.clone(),
                };
                (def.name.clone(), ctor)
            })
            .collect();

        let non_models = schema
            .non_models
            .values()
            .map(|def| {
                let ctor = NonModelConstructor {
                    definition: Arc::new(def.clone()),
                    schema: schema.clone(),
                };
                (def.name.clone(), ctor)
            })
            .collect();

        Ok(Self {
            schema,
            models,
            non_models,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Constructor for a model type.
    pub fn model(&self, name: &str) -> Option<ModelConstructor> {
        self.models.get(name).cloned()
    }

    /// Constructor for a non-model type.
    pub fn non_model(&self, name: &str) -> Option<NonModelConstructor> {
        self.non_models.get(name).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelConstructor> {
        self.models.values()
    }

    /// Whether `ctor` is one of this registry's constructors.
    pub fn contains(&self, ctor: &ModelConstructor) -> bool {
        self.models
            .get(ctor.name())
            .is_some_and(|own| Arc::ptr_eq(&own.definition, &ctor.definition))
    }
}
