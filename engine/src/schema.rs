//! Schema definition.
//!
//! A schema lists model and non-model type definitions. It is consumed once
//! by the [`Registry`](crate::Registry), which derives one constructor per
//! type from it.

use crate::{error::Result, Error, ModelName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    ID,
    String,
    Int,
    Float,
    Boolean,
    AWSDate,
    AWSTime,
    AWSDateTime,
    AWSTimestamp,
    AWSEmail,
    AWSJSON,
    AWSURL,
    AWSPhone,
    AWSIPAddress,
    /// Value of a declared enum
    Enum(String),
    /// Nested non-model value object
    NonModel(String),
    /// Relation to another model
    Model(String),
}

impl FieldType {
    /// Scalar types whose values are strings with a format constraint.
    pub fn has_format(&self) -> bool {
        matches!(
            self,
            FieldType::AWSDate
                | FieldType::AWSTime
                | FieldType::AWSDateTime
                | FieldType::AWSEmail
                | FieldType::AWSJSON
                | FieldType::AWSURL
                | FieldType::AWSPhone
                | FieldType::AWSIPAddress
        )
    }

    /// Name of the primitive value kind the field holds.
    pub fn primitive(&self) -> &'static str {
        match self {
            FieldType::Int | FieldType::Float | FieldType::AWSTimestamp => "number",
            FieldType::Boolean => "boolean",
            FieldType::NonModel(_) | FieldType::Model(_) => "object",
            _ => "string",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::ID => write!(f, "ID"),
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Boolean => write!(f, "Boolean"),
            FieldType::AWSDate => write!(f, "AWSDate"),
            FieldType::AWSTime => write!(f, "AWSTime"),
            FieldType::AWSDateTime => write!(f, "AWSDateTime"),
            FieldType::AWSTimestamp => write!(f, "AWSTimestamp"),
            FieldType::AWSEmail => write!(f, "AWSEmail"),
            FieldType::AWSJSON => write!(f, "AWSJSON"),
            FieldType::AWSURL => write!(f, "AWSURL"),
            FieldType::AWSPhone => write!(f, "AWSPhone"),
            FieldType::AWSIPAddress => write!(f, "AWSIPAddress"),
            FieldType::Enum(name) | FieldType::NonModel(name) | FieldType::Model(name) => {
                write!(f, "{}", name)
            }
        }
    }
}

/// How a field relates its model to another model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Association {
    #[default]
    None,
    /// The foreign key `target_name` lives on this model.
    #[serde(rename_all = "camelCase")]
    BelongsTo { target_name: String },
    /// This model owns exactly one related record. The key is either
    /// `target_name` on this model or `associated_with` on the child.
    #[serde(rename_all = "camelCase")]
    HasOne {
        associated_with: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_name: Option<String>,
    },
    /// Children carry this model's id in `associated_with`.
    #[serde(rename_all = "camelCase")]
    HasMany { associated_with: String },
}

impl Association {
    /// Foreign key stored on the owning model, if any.
    pub fn local_key(&self) -> Option<&str> {
        match self {
            Association::BelongsTo { target_name } => Some(target_name),
            Association::HasOne {
                target_name: Some(target_name),
                ..
            } => Some(target_name),
            _ => None,
        }
    }
}

/// Definition of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether a non-null value must be present
    #[serde(default)]
    pub required: bool,
    /// Whether the field holds a list of `field_type`
    #[serde(default)]
    pub is_array: bool,
    /// Whether list elements may be null
    #[serde(default)]
    pub is_array_nullable: bool,
    /// Only internal machinery may set this field
    #[serde(default)]
    pub read_only: bool,
    /// Relationship, for fields of type `Model`
    #[serde(default)]
    pub association: Association,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            is_array: false,
            is_array_nullable: false,
            read_only: false,
            association: Association::None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    /// Turn this field into a list of its type.
    pub fn array(mut self, nullable_elements: bool) -> Self {
        self.is_array = true;
        self.is_array_nullable = nullable_elements;
        self
    }

    /// Mark this field as read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Attach a relationship to this field.
    pub fn with_association(mut self, association: Association) -> Self {
        self.association = association;
        self
    }

    /// Whether the field holds relation data instead of a stored value.
    pub fn is_relation(&self) -> bool {
        matches!(self.field_type, FieldType::Model(_))
    }

    /// Related model name for relation fields.
    pub fn related_model(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::Model(name) => Some(name),
            _ => None,
        }
    }
}

/// Definition of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    /// Model name
    pub name: ModelName,
    /// Plural name used by sync queries
    #[serde(default)]
    pub plural_name: Option<String>,
    /// Ordered field definitions
    pub fields: Vec<FieldDef>,
    /// Whether the model participates in remote sync
    #[serde(default = "default_syncable")]
    pub syncable: bool,
}

fn default_syncable() -> bool {
    true
}

impl ModelDefinition {
    /// Create a syncable model definition.
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            plural_name: None,
            fields,
            syncable: true,
        }
    }

    /// Create a model that never leaves the device.
    pub fn local_only(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            syncable: false,
            ..Self::new(name, fields)
        }
    }

    /// Set the plural name.
    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural_name = Some(plural.into());
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Plural name, defaulting to `name + "s"`.
    pub fn plural(&self) -> String {
        self.plural_name
            .clone()
            .unwrap_or_else(|| format!("{}s", self.name))
    }

    /// Relation fields with their associations.
    pub fn relations(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_relation())
    }

    /// Add `createdAt`/`updatedAt` as read-only timestamps when missing.
    fn with_timestamps(mut self) -> Self {
        for name in ["createdAt", "updatedAt"] {
            match self.fields.iter_mut().find(|f| f.name == name) {
                Some(field) => field.read_only = true,
                None => self
                    .fields
                    .push(FieldDef::optional(name, FieldType::AWSDateTime).read_only()),
            }
        }
        self
    }
}

/// Definition of a non-model (nested value) type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonModelDefinition {
    /// Type name
    pub name: String,
    /// Ordered field definitions
    pub fields: Vec<FieldDef>,
}

impl NonModelDefinition {
    /// Create a new non-model definition.
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Schema for the entire store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version; local data is wiped when it changes
    pub version: String,
    /// Model definitions by name
    #[serde(default)]
    pub models: BTreeMap<ModelName, ModelDefinition>,
    /// Non-model definitions by name
    #[serde(default)]
    pub non_models: BTreeMap<String, NonModelDefinition>,
    /// Enum values by enum name
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<String>>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    /// Add a model to the schema.
    pub fn add_model(&mut self, model: ModelDefinition) -> &mut Self {
        let model = model.with_timestamps();
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Builder-style method to add a model.
    pub fn with_model(mut self, model: ModelDefinition) -> Self {
        self.add_model(model);
        self
    }

    /// Builder-style method to add a non-model type.
    pub fn with_non_model(mut self, non_model: NonModelDefinition) -> Self {
        self.non_models.insert(non_model.name.clone(), non_model);
        self
    }

    /// Builder-style method to add an enum.
    pub fn with_enum<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enums
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Get a model definition by name.
    pub fn get_model(&self, name: &str) -> Option<&ModelDefinition> {
        self.models.get(name)
    }

    /// Get a non-model definition by name.
    pub fn get_non_model(&self, name: &str) -> Option<&NonModelDefinition> {
        self.non_models.get(name)
    }

    /// Parse a schema from JSON, adding implicit timestamp fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut schema: Schema =
            serde_json::from_str(json).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        schema.models = std::mem::take(&mut schema.models)
            .into_iter()
            .map(|(name, model)| (name, model.with_timestamps()))
            .collect();
        Ok(schema)
    }

    /// Check that every referenced type is declared.
    pub fn check_references(&self) -> Result<()> {
        let fields = self
            .models
            .values()
            .flat_map(|m| m.fields.iter())
            .chain(self.non_models.values().flat_map(|n| n.fields.iter()));

        for field in fields {
            let known = match &field.field_type {
                FieldType::Model(name) => self.models.contains_key(name),
                FieldType::NonModel(name) => self.non_models.contains_key(name),
                FieldType::Enum(name) => self.enums.contains_key(name),
                _ => true,
            };
            if !known {
                return Err(Error::UnknownType(field.field_type.to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
        Schema::new("1")
            .with_model(ModelDefinition::new(
                "Post",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("comments", FieldType::Model("Comment".into()))
                        .array(false)
                        .with_association(Association::HasMany {
                            associated_with: "postID".into(),
                        }),
                ],
            ))
            .with_model(ModelDefinition::new(
                "Comment",
                vec![
                    FieldDef::required("content", FieldType::String),
                    FieldDef::required("postID", FieldType::ID),
                    FieldDef::optional("post", FieldType::Model("Post".into())).with_association(
                        Association::BelongsTo {
                            target_name: "postID".into(),
                        },
                    ),
                ],
            ))
    }

    #[test]
    fn timestamps_are_added_read_only() {
        let schema = test_schema();
        let post = schema.get_model("Post").unwrap();

        let created = post.field("createdAt").unwrap();
        assert!(created.read_only);
        assert!(!created.required);
        assert_eq!(created.field_type, FieldType::AWSDateTime);
        assert!(post.field("updatedAt").unwrap().read_only);
    }

    #[test]
    fn plural_defaults_to_name_with_s() {
        let schema = test_schema();
        assert_eq!(schema.get_model("Post").unwrap().plural(), "Posts");

        let people = ModelDefinition::new("Person", vec![]).with_plural("People");
        assert_eq!(people.plural(), "People");
    }

    #[test]
    fn relation_keys() {
        let schema = test_schema();
        let comment = schema.get_model("Comment").unwrap();
        let post_field = comment.field("post").unwrap();

        assert!(post_field.is_relation());
        assert_eq!(post_field.related_model(), Some("Post"));
        assert_eq!(post_field.association.local_key(), Some("postID"));

        let post = schema.get_model("Post").unwrap();
        assert_eq!(post.relations().count(), 1);
        assert_eq!(post.field("comments").unwrap().association.local_key(), None);
    }

    #[test]
    fn unknown_references_are_rejected() {
        let schema = Schema::new("1").with_model(ModelDefinition::new(
            "Post",
            vec![FieldDef::optional("meta", FieldType::NonModel("Meta".into()))],
        ));

        assert!(matches!(
            schema.check_references(),
            Err(Error::UnknownType(t)) if t == "Meta"
        ));
        assert!(test_schema().check_references().is_ok());
    }

    #[test]
    fn schema_from_json() {
        let json = r#"{
            "version": "7",
            "models": {
                "Todo": {
                    "name": "Todo",
                    "fields": [
                        {"name": "name", "fieldType": "String", "required": true},
                        {"name": "tags", "fieldType": "String", "isArray": true, "isArrayNullable": true}
                    ],
                    "syncable": false
                }
            }
        }"#;

        let schema = Schema::from_json(json).unwrap();
        let todo = schema.get_model("Todo").unwrap();

        assert_eq!(schema.version, "7");
        assert!(!todo.syncable);
        assert!(todo.field("tags").unwrap().is_array_nullable);
        assert!(todo.field("updatedAt").unwrap().read_only);
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::AWSIPAddress.to_string(), "AWSIPAddress");
        assert_eq!(FieldType::NonModel("Metadata".into()).to_string(), "Metadata");
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
