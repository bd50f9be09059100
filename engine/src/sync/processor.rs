//! Remote sync requests.
//!
//! [`SyncProcessor::execute_remote_sync`] sends one request with jittered
//! retry. Failures are inspected before retrying:
//!
//! 1. authorization failures abort as [`Error::NonRetryable`]
//! 2. every per-item error is classified and passed to the error handler
//! 3. with partial data enabled, a response that still carries data has its
//!    null items dropped, a hub event is dispatched and the rest is returned
//! 4. anything else is raised for the retry loop to decide

use super::errors::{
    classify, classify_graphql, is_non_retryable, ErrorHandler, ErrorType, SyncErrorContext,
    SyncProcess,
};
use super::outbox::OutboxMutation;
use super::retry::{jittered_retry, RetryConfig};
use super::transport::{AuthMode, GraphQLRequest, Transport, TransportError, USER_AGENT_SUFFIX};
use super::{Hub, HubEvent};
use crate::mutation::OpType;
use crate::{error::Result, Error, FieldType, ModelConstructor, ModelDefinition};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Descriptor of one remote request.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub query: String,
    pub variables: Value,
    /// Root field of the response, e.g. `syncPosts`
    pub op_name: String,
    pub model_name: String,
    /// Overrides the processor's auth strategy
    pub auth_mode: Option<AuthMode>,
}

/// How auth modes are chosen for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthModeStrategy {
    /// Always the configured default mode
    #[default]
    Default,
    /// Try each mode in order, moving on when one is unauthorized
    MultiAuth(Vec<AuthMode>),
}

/// Sends sync queries and mutations.
pub struct SyncProcessor {
    transport: Arc<dyn Transport>,
    hub: Hub,
    error_handler: ErrorHandler,
    retry: RetryConfig,
    partial_data: bool,
    default_auth: AuthMode,
    auth_strategy: AuthModeStrategy,
}

impl SyncProcessor {
    pub fn new(
        transport: Arc<dyn Transport>,
        hub: Hub,
        error_handler: ErrorHandler,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            hub,
            error_handler,
            retry,
            partial_data: false,
            default_auth: AuthMode::AmazonCognitoUserPools,
            auth_strategy: AuthModeStrategy::Default,
        }
    }

    /// Keep successfully synced items of partially failed responses.
    pub fn with_partial_data(mut self, enabled: bool) -> Self {
        self.partial_data = enabled;
        self
    }

    pub fn with_auth(mut self, default_auth: AuthMode, strategy: AuthModeStrategy) -> Self {
        self.default_auth = default_auth;
        self.auth_strategy = strategy;
        self
    }

    fn auth_modes(&self, op: &SyncOperation) -> Vec<AuthMode> {
        if let Some(mode) = op.auth_mode {
            return vec![mode];
        }
        match &self.auth_strategy {
            AuthModeStrategy::MultiAuth(modes) if !modes.is_empty() => modes.clone(),
            _ => vec![self.default_auth],
        }
    }

    /// Send one request with retry, trying each auth mode in turn.
    pub async fn execute_remote_sync(&self, op: &SyncOperation) -> Result<Value> {
        let modes = self.auth_modes(op);
        let mut last_error = None;

        for (i, mode) in modes.iter().enumerate() {
            let result = jittered_retry(&self.retry, |attempt| {
                tracing::debug!(op = %op.op_name, auth = %mode, attempt, "sending sync request");
                self.attempt(op, *mode)
            })
            .await;

            match result {
                Ok(data) => return Ok(data),
                Err(err) if is_unauthorized(&err) && i + 1 < modes.len() => {
                    tracing::debug!(op = %op.op_name, auth = %mode, "unauthorized, trying next auth mode");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(Error::NonRetryable {
            message: "no auth mode available".to_string(),
        }))
    }

    async fn attempt(&self, op: &SyncOperation, auth_mode: AuthMode) -> Result<Value> {
        let request = GraphQLRequest {
            query: op.query.clone(),
            variables: op.variables.clone(),
            auth_mode,
            user_agent_suffix: USER_AGENT_SUFFIX.to_string(),
        };

        let err = match self.transport.graphql(request).await {
            Ok(data) => return Ok(data),
            Err(err) => err,
        };

        if is_non_retryable(&err) {
            return Err(Error::NonRetryable {
                message: err.to_string(),
            });
        }

        let error_type = self.report(op, &err);

        if self.partial_data {
            if let Some(data) = usable_data(err.data.as_ref(), &op.op_name) {
                self.hub.dispatch(HubEvent::SyncQueriesPartialSyncError {
                    errors: err.errors.clone(),
                    model_name: op.model_name.clone(),
                });
                return Ok(data);
            }
        }

        Err(Error::Sync {
            errors: err.errors,
            error_type,
        })
    }

    /// Classify each error and hand it to the error handler.
    ///
    /// Returns the type of the whole failure: transient if any part is.
    fn report(&self, op: &SyncOperation, err: &TransportError) -> ErrorType {
        let mut types = Vec::new();

        if err.errors.is_empty() {
            let message = err.to_string();
            types.push((classify(&message, err.status, None), message));
        } else {
            for e in &err.errors {
                types.push((classify_graphql(e, err.status), e.message.clone()));
            }
        }

        for (error_type, message) in &types {
            (self.error_handler)(&SyncErrorContext {
                operation: op.op_name.clone(),
                process: SyncProcess::Sync,
                error_type: *error_type,
                message: message.clone(),
                model: op.model_name.clone(),
                record: None,
            });
        }

        if types.iter().any(|(t, _)| *t == ErrorType::Transient) {
            ErrorType::Transient
        } else {
            types.first().map_or(ErrorType::Unknown, |(t, _)| *t)
        }
    }

    /// Page through `sync{Plural}` until exhausted or `max_records` reached.
    pub async fn sync_model(
        &self,
        ctor: &ModelConstructor,
        page_size: usize,
        max_records: usize,
        last_sync: Option<i64>,
    ) -> Result<SyncPage> {
        let definition = ctor.definition();
        let op_name = format!("sync{}", definition.plural());
        let query = sync_query(definition);

        let mut page = SyncPage::default();
        let mut next_token: Option<String> = None;

        loop {
            let remaining = max_records.saturating_sub(page.items.len());
            if remaining == 0 {
                break;
            }

            let op = SyncOperation {
                query: query.clone(),
                variables: json!({
                    "limit": page_size.min(remaining),
                    "nextToken": next_token,
                    "lastSync": last_sync,
                }),
                op_name: op_name.clone(),
                model_name: definition.name.clone(),
                auth_mode: None,
            };

            let data = self.execute_remote_sync(&op).await?;
            let connection = data.get(&op_name).cloned().unwrap_or(Value::Null);
            let items = connection
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            tracing::debug!(model = %definition.name, items = items.len(), "received sync page");

            page.items.extend(items.into_iter().filter(|i| !i.is_null()));
            page.started_at = connection
                .get("startedAt")
                .and_then(Value::as_i64)
                .or(page.started_at);

            next_token = connection
                .get("nextToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        page.items.truncate(max_records);
        Ok(page)
    }

    /// Push one outbox mutation; returns the server's copy of the record.
    pub async fn mutate(&self, mutation: &OutboxMutation, definition: &ModelDefinition) -> Result<Value> {
        let (op_name, input) = match mutation.op_type {
            OpType::Insert => (
                format!("create{}", definition.name),
                mutation_input(&mutation.element.to_json(), definition, false),
            ),
            OpType::Update => (
                format!("update{}", definition.name),
                mutation_input(&mutation.element.to_json(), definition, false),
            ),
            OpType::Delete => (
                format!("delete{}", definition.name),
                mutation_input(&mutation.element.to_json(), definition, true),
            ),
        };

        let op = SyncOperation {
            query: mutation_query(&op_name, definition),
            variables: json!({
                "input": input,
                "condition": mutation.condition,
            }),
            op_name: op_name.clone(),
            model_name: definition.name.clone(),
            auth_mode: None,
        };

        let data = self.execute_remote_sync(&op).await.inspect_err(|err| {
            (self.error_handler)(&SyncErrorContext {
                operation: op_name.clone(),
                process: SyncProcess::Mutate,
                error_type: error_type_of(err),
                message: err.to_string(),
                model: definition.name.clone(),
                record: Some(mutation.element.to_json()),
            });
        })?;

        Ok(data.get(&op_name).cloned().unwrap_or(Value::Null))
    }
}

impl std::fmt::Debug for SyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProcessor")
            .field("partial_data", &self.partial_data)
            .field("default_auth", &self.default_auth)
            .field("auth_strategy", &self.auth_strategy)
            .finish_non_exhaustive()
    }
}

/// Items of one model's pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPage {
    pub items: Vec<Value>,
    pub started_at: Option<i64>,
}

fn is_unauthorized(err: &Error) -> bool {
    matches!(
        err,
        Error::NonRetryable { .. }
            | Error::Sync {
                error_type: ErrorType::Unauthorized,
                ..
            }
    )
}

pub(crate) fn error_type_of(err: &Error) -> ErrorType {
    match err {
        Error::Sync { error_type, .. } => *error_type,
        Error::NonRetryable { .. } => ErrorType::Unauthorized,
        _ => ErrorType::Unknown,
    }
}

/// Data of a failed response that can still be used: the op's root field
/// must be present, and null items are dropped.
fn usable_data(data: Option<&Value>, op_name: &str) -> Option<Value> {
    let mut data = data?.clone();
    let root = data.get_mut(op_name).filter(|r| !r.is_null())?;

    if let Some(items) = root.get_mut("items").and_then(Value::as_array_mut) {
        items.retain(|item| !item.is_null());
    }
    Some(data)
}

/// Scalar selection set of a model, plus sync metadata.
fn selection(definition: &ModelDefinition) -> String {
    let mut fields = vec!["id".to_string()];
    for field in &definition.fields {
        match &field.field_type {
            FieldType::Model(_) => {}
            FieldType::NonModel(_) => {}
            _ if field.name != "id" => fields.push(field.name.clone()),
            _ => {}
        }
    }
    fields.extend(["_version", "_lastChangedAt", "_deleted"].map(String::from));
    fields.join("\n")
}

fn sync_query(definition: &ModelDefinition) -> String {
    format!(
        "query operation($limit: Int, $nextToken: String, $lastSync: AWSTimestamp) {{\n\
         sync{plural}(limit: $limit, nextToken: $nextToken, lastSync: $lastSync) {{\n\
         items {{\n{fields}\n}}\nnextToken\nstartedAt\n}}\n}}",
        plural = definition.plural(),
        fields = selection(definition),
    )
}

fn mutation_query(op_name: &str, definition: &ModelDefinition) -> String {
    let kind = &op_name[..op_name.len() - definition.name.len()];
    let input_type = format!(
        "{}{}Input",
        kind[..1].to_ascii_uppercase(),
        &op_name[1..]
    );
    format!(
        "mutation operation($input: {input_type}!, $condition: Model{name}ConditionInput) {{\n\
         {op_name}(input: $input, condition: $condition) {{\n{fields}\n}}\n}}",
        name = definition.name,
        fields = selection(definition),
    )
}

/// Input object of a mutation: stored fields without read-only ones.
fn mutation_input(record: &Value, definition: &ModelDefinition, delete: bool) -> Value {
    let Some(record) = record.as_object() else {
        return Value::Null;
    };
    let mut input = Map::new();

    for (key, value) in record {
        let keep = if delete {
            key == "id" || key == "_version"
        } else {
            key == "id"
                || key == "_version"
                || definition
                    .field(key)
                    .is_some_and(|f| !f.read_only && !f.is_relation())
        };
        if keep {
            input.insert(key.clone(), value.clone());
        }
    }
    Value::Object(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, Schema};

    fn post_definition() -> ModelDefinition {
        Schema::new("1")
            .with_model(ModelDefinition::new(
                "Post",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("count", FieldType::Int),
                ],
            ))
            .get_model("Post")
            .cloned()
            .unwrap()
    }

    #[test]
    fn partial_data_filters_null_items() {
        let data = json!({"syncPosts": {"items": [{"id": "1"}, null, {"id": "3"}]}});
        let usable = usable_data(Some(&data), "syncPosts").unwrap();
        assert_eq!(usable, json!({"syncPosts": {"items": [{"id": "1"}, {"id": "3"}]}}));

        assert!(usable_data(None, "syncPosts").is_none());
        assert!(usable_data(Some(&json!({"syncPosts": null})), "syncPosts").is_none());
    }

    #[test]
    fn generated_documents() {
        let def = post_definition();

        let query = sync_query(&def);
        assert!(query.contains("syncPosts(limit: $limit"));
        assert!(query.contains("title"));
        assert!(query.contains("_deleted"));

        let mutation = mutation_query("createPost", &def);
        assert!(mutation.contains("$input: CreatePostInput!"));
        assert!(mutation.contains("ModelPostConditionInput"));
    }

    #[test]
    fn mutation_input_drops_read_only_fields() {
        let def = post_definition();
        let record = json!({
            "id": "1",
            "title": "t",
            "createdAt": "2021-06-03T20:56:23.201Z",
            "_version": 2,
            "_lastChangedAt": 1
        });

        assert_eq!(
            mutation_input(&record, &def, false),
            json!({"id": "1", "title": "t", "_version": 2})
        );
        assert_eq!(
            mutation_input(&record, &def, true),
            json!({"id": "1", "_version": 2})
        );
    }
}
