//! Boundaries to the external collaborators of the process core.
//!
//! The dynamic object store, secret storage, outbound service dispatch,
//! push notifications, user directory and HTTP transport all live outside
//! this crate. Implementations are provided by the state crates and the
//! server.

use crate::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Fixed service-dispatch channel names
pub mod channels {
    /// Email delivery; payload `{to, from, subject, html}`
    pub const EMAIL_SEND: &str = "email.send";
    /// Create a remote user form; replies `{uuid}`
    pub const USER_FORM_CREATE: &str = "userform.create";
    /// Poll a remote user form; replies `{status, response, responder}`
    pub const USER_FORM_STATUS: &str = "userform.status";
    /// Mint a password-reset URL; replies `{url}`
    pub const PASSWORD_RESET_URL: &str = "user.password-reset-url";
    /// Developer-facing notification channel for task failures
    pub const DEVELOPER: &str = "developer";
}

/// Opaque handle of a store transaction, forwarded untouched to the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle(pub String);

/// Schema of a user-defined business object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectType {
    /// Object ID
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Primary-key column
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Field definitions
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl ObjectType {
    /// Find a field by ID
    pub fn field(&self, field_id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == field_id)
    }
}

/// A field of a business object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field ID
    pub id: String,
    /// Column holding the value in a row
    pub column: String,
    /// Field kind
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldDef {
    /// The connection definition, if this is a relationship field
    pub fn connection(&self) -> Option<&ConnectionDef> {
        match &self.kind {
            FieldKind::Connection(c) => Some(c),
            _ => None,
        }
    }
}

/// Kind of a field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Plain stored value
    #[default]
    Value,
    /// Relationship to another object; the column holds the related id(s)
    Connection(ConnectionDef),
    /// Computed from other columns of the same row
    Formula {
        /// Arithmetic expression with `{column}` placeholders
        expression: String,
    },
}

/// Relationship description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDef {
    /// Related object ID
    pub object: String,
    /// To-many relationship
    #[serde(default)]
    pub many: bool,
    /// Extra equality matches on the related object (polymorphic links)
    #[serde(default)]
    pub index_fields: Vec<IndexMatch>,
}

/// Equality match on a column of the related object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMatch {
    /// Column on the related object
    pub column: String,
    /// Required value
    pub value: Value,
}

/// A record-selection condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// `column = value`
    Eq {
        /// Column
        column: String,
        /// Value
        value: Value,
    },
    /// `column IN (values)`
    In {
        /// Column
        column: String,
        /// Values
        values: Vec<Value>,
    },
}

/// A find request against one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Object ID
    pub object: String,
    /// Conjunction of conditions
    pub conditions: Vec<Condition>,
}

impl RecordQuery {
    /// Query every row of an object
    pub fn all(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            conditions: Vec::new(),
        }
    }

    /// Add a condition
    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// The dynamic object store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Look up an object's schema
    async fn object_type(&self, object_id: &str) -> Result<Option<ObjectType>, CoreError>;

    /// Find rows
    async fn find<'a>(
        &self,
        query: &RecordQuery,
        tx: Option<&'a TransactionHandle>,
    ) -> Result<Vec<Value>, CoreError>;

    /// Update one row by primary key and return the updated row
    async fn update<'a>(
        &self,
        object_id: &str,
        id: &Value,
        values: &Map<String, Value>,
        tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError>;

    /// Invoke a stored procedure
    async fn call_procedure<'a>(
        &self,
        name: &str,
        args: &[Value],
        tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError>;
}

/// Named secrets, scoped by owner (the task ID)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a decrypted secret value
    async fn get_value(&self, owner_id: &str, name: &str) -> Result<Option<String>, CoreError>;
}

/// Fire-and-reply request primitive for outbound services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceDispatch: Send + Sync {
    /// Send a request on a channel and wait for the reply.
    ///
    /// A reply carrying an error is returned as `CoreError::RemoteServiceError`.
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, CoreError>;
}

/// Live push notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Push to one user's session channel
    async fn push_to_user(&self, user_id: &str, payload: Value) -> Result<(), CoreError>;

    /// Broadcast on a named channel
    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), CoreError>;
}

/// A platform user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: String,
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
}

/// Role membership and account lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Members of any of the given roles
    async fn users_in_roles(&self, roles: &[String]) -> Result<Vec<User>, CoreError>;

    /// Users matching any of the given IDs or usernames
    async fn find_users(&self, ids_or_usernames: &[String]) -> Result<Vec<User>, CoreError>;
}

/// An outbound HTTP request built by the HTTP task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method
    pub method: String,
    /// URL
    pub url: String,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// Raw body
    pub body: Option<String>,
}

/// The raw response of an HTTP call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// Raw body
    pub body: String,
}

/// HTTP transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue one request
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError>;
}
