//! Network collaborator contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

/// User agent suffix attached to every request.
pub const USER_AGENT_SUFFIX: &str = "stash-datastore";

/// Authorization mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    ApiKey,
    AmazonCognitoUserPools,
    #[serde(rename = "AWS_IAM")]
    Iam,
    #[serde(rename = "OPENID_CONNECT")]
    OpenIdConnect,
    #[serde(rename = "AWS_LAMBDA")]
    Lambda,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::ApiKey => "API_KEY",
            AuthMode::AmazonCognitoUserPools => "AMAZON_COGNITO_USER_POOLS",
            AuthMode::Iam => "AWS_IAM",
            AuthMode::OpenIdConnect => "OPENID_CONNECT",
            AuthMode::Lambda => "AWS_LAMBDA",
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "API_KEY" => Ok(AuthMode::ApiKey),
            "AMAZON_COGNITO_USER_POOLS" => Ok(AuthMode::AmazonCognitoUserPools),
            "AWS_IAM" => Ok(AuthMode::Iam),
            "OPENID_CONNECT" => Ok(AuthMode::OpenIdConnect),
            "AWS_LAMBDA" => Ok(AuthMode::Lambda),
            other => Err(format!("unknown auth mode: {}", other)),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Value,
    pub auth_mode: AuthMode,
    pub user_agent_suffix: String,
}

/// A per-item error reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

/// A rejected request, possibly carrying partial data.
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("{}", self.describe())]
pub struct TransportError {
    /// Top-level failure message, for errors raised before a response
    pub message: Option<String>,
    /// HTTP status, when known
    pub status: Option<u16>,
    pub data: Option<Value>,
    pub errors: Vec<GraphQLError>,
}

impl TransportError {
    /// A failure with only a message, such as a local auth error.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// An HTTP-level failure.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A response with errors and optional partial data.
    pub fn graphql(data: Option<Value>, errors: Vec<GraphQLError>) -> Self {
        Self {
            data,
            errors,
            ..Self::default()
        }
    }

    /// Every message carried by this error.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.message
            .as_deref()
            .into_iter()
            .chain(self.errors.iter().map(|e| e.message.as_str()))
    }

    fn describe(&self) -> String {
        let messages: Vec<_> = self.messages().collect();
        if messages.is_empty() {
            "request failed".to_string()
        } else {
            messages.join("; ")
        }
    }
}

/// Sends one request to the remote service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn graphql(&self, request: GraphQLRequest) -> Result<Value, TransportError>;
}
