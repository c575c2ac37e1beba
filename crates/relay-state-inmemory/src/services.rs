//! In-memory implementations of the service ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use relay_core::{
    domain::ports::{
        Broadcaster, Condition, HttpClient, HttpRequest, HttpResponse, ObjectStore, ObjectType,
        RecordQuery, SecretStore, ServiceDispatch, TransactionHandle, User, UserDirectory,
    },
    CoreError, Services,
};

/// A stored procedure body
pub type ProcedureHandler = Arc<dyn Fn(&[Value]) -> Result<Value, CoreError> + Send + Sync>;

/// A service-dispatch channel handler
pub type ChannelHandler = Arc<dyn Fn(Value) -> Result<Value, CoreError> + Send + Sync>;

#[derive(Default)]
struct Tables {
    schemas: HashMap<String, ObjectType>,
    rows: HashMap<String, Vec<Value>>,
    procedures: HashMap<String, ProcedureHandler>,
    calls: Vec<(String, Vec<Value>)>,
    transient_failures: usize,
}

impl Tables {
    /// Consume one injected transient failure, if any are left
    fn take_failure(&mut self, operation: &str) -> Result<(), CoreError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            warn!(operation, "Injected transient failure");
            return Err(CoreError::Transient(format!("{} connection reset", operation)));
        }
        Ok(())
    }
}

fn matches(row: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::Eq { column, value } => row.get(column) == Some(value),
        Condition::In { column, values } => row.get(column).map_or(false, |v| values.contains(v)),
    }
}

/// Object store over in-memory tables.
///
/// Tables are keyed by object ID; rows are JSON objects keyed by column.
#[derive(Default)]
pub struct InMemoryObjectStore {
    tables: RwLock<Tables>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object type with its initial rows
    pub async fn define(&self, object: ObjectType, rows: Vec<Value>) {
        let mut tables = self.tables.write().await;
        tables.rows.insert(object.id.clone(), rows);
        tables.schemas.insert(object.id.clone(), object);
    }

    /// Register a stored procedure
    pub async fn procedure<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[Value]) -> Result<Value, CoreError> + Send + Sync + 'static,
    {
        let mut tables = self.tables.write().await;
        tables.procedures.insert(name.to_string(), Arc::new(handler));
    }

    /// Make the next `count` store calls fail with a transient error
    pub async fn fail_next(&self, count: usize) {
        self.tables.write().await.transient_failures = count;
    }

    /// Current rows of an object
    pub async fn rows(&self, object_id: &str) -> Vec<Value> {
        let tables = self.tables.read().await;
        tables.rows.get(object_id).cloned().unwrap_or_default()
    }

    /// Every stored-procedure call, in order
    pub async fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.tables.read().await.calls.clone()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn object_type(&self, object_id: &str) -> Result<Option<ObjectType>, CoreError> {
        let tables = self.tables.read().await;
        Ok(tables.schemas.get(object_id).cloned())
    }

    async fn find<'a>(
        &self,
        query: &RecordQuery,
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Vec<Value>, CoreError> {
        let mut tables = self.tables.write().await;
        tables.take_failure("find")?;
        let rows = tables
            .rows
            .get(&query.object)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.conditions.iter().all(|c| matches(row, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn update<'a>(
        &self,
        object_id: &str,
        id: &Value,
        values: &Map<String, Value>,
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        let mut tables = self.tables.write().await;
        tables.take_failure("update")?;
        let primary_key = tables
            .schemas
            .get(object_id)
            .map(|object| object.primary_key.clone())
            .ok_or_else(|| CoreError::StateStoreError(format!("No table {}", object_id)))?;
        let row = tables
            .rows
            .get_mut(object_id)
            .and_then(|rows| rows.iter_mut().find(|row| row.get(&primary_key) == Some(id)))
            .ok_or_else(|| {
                CoreError::StateStoreError(format!("No {} row with {} = {}", object_id, primary_key, id))
            })?;
        if let Value::Object(columns) = row {
            for (column, value) in values {
                columns.insert(column.clone(), value.clone());
            }
        }
        debug!(object = object_id, id = %id, "Row updated");
        Ok(row.clone())
    }

    async fn call_procedure<'a>(
        &self,
        name: &str,
        args: &[Value],
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        let handler = {
            let mut tables = self.tables.write().await;
            tables.take_failure("call_procedure")?;
            tables.calls.push((name.to_string(), args.to_vec()));
            tables.procedures.get(name).cloned()
        };
        match handler {
            Some(handler) => handler(args),
            None => Err(CoreError::StateStoreError(format!("No procedure {}", name))),
        }
    }
}

/// Secrets keyed by owner (task ID) and name
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemorySecretStore {
    /// Seed from owner -> name -> value
    pub fn from_map(secrets: HashMap<String, HashMap<String, String>>) -> Self {
        Self {
            secrets: RwLock::new(secrets),
        }
    }

    /// Store one secret
    pub async fn insert(&self, owner_id: &str, name: &str, value: &str) {
        let mut secrets = self.secrets.write().await;
        secrets
            .entry(owner_id.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_value(&self, owner_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        let secrets = self.secrets.read().await;
        Ok(secrets.get(owner_id).and_then(|named| named.get(name)).cloned())
    }
}

/// Service dispatch that routes each channel to a registered handler
#[derive(Default)]
pub struct InMemoryServiceDispatch {
    handlers: RwLock<HashMap<String, ChannelHandler>>,
    requests: RwLock<Vec<(String, Value)>>,
}

impl InMemoryServiceDispatch {
    /// Create a dispatch with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of a channel
    pub async fn handle<F>(&self, channel: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, CoreError> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(channel.to_string(), Arc::new(handler));
    }

    /// Payloads sent on a channel, in order
    pub async fn sent(&self, channel: &str) -> Vec<Value> {
        let requests = self.requests.read().await;
        requests
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl ServiceDispatch for InMemoryServiceDispatch {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, CoreError> {
        self.requests
            .write()
            .await
            .push((channel.to_string(), payload.clone()));
        let handler = self.handlers.read().await.get(channel).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => Err(CoreError::RemoteServiceError(format!(
                "No service listens on {}",
                channel
            ))),
        }
    }
}

/// A message delivered through the broadcaster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    /// User ID for a push, channel name for a broadcast
    pub target: String,
    /// Message body
    pub payload: Value,
    /// Delivery time
    pub at: DateTime<Utc>,
}

/// Broadcaster that records every delivery
#[derive(Default)]
pub struct InMemoryBroadcaster {
    pushes: RwLock<Vec<Delivery>>,
    broadcasts: RwLock<Vec<Delivery>>,
}

impl InMemoryBroadcaster {
    /// Messages pushed to one user
    pub async fn pushed_to(&self, user_id: &str) -> Vec<Value> {
        let pushes = self.pushes.read().await;
        pushes
            .iter()
            .filter(|d| d.target == user_id)
            .map(|d| d.payload.clone())
            .collect()
    }

    /// Messages broadcast on one channel
    pub async fn broadcast_on(&self, channel: &str) -> Vec<Value> {
        let broadcasts = self.broadcasts.read().await;
        broadcasts
            .iter()
            .filter(|d| d.target == channel)
            .map(|d| d.payload.clone())
            .collect()
    }
}

#[async_trait]
impl Broadcaster for InMemoryBroadcaster {
    async fn push_to_user(&self, user_id: &str, payload: Value) -> Result<(), CoreError> {
        self.pushes.write().await.push(Delivery {
            target: user_id.to_string(),
            payload,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), CoreError> {
        self.broadcasts.write().await.push(Delivery {
            target: channel.to_string(),
            payload,
            at: Utc::now(),
        });
        Ok(())
    }
}

/// User directory over a fixed user list
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<Vec<(User, Vec<String>)>>,
}

impl InMemoryUserDirectory {
    /// Add a user with the given roles
    pub async fn add(&self, user: User, roles: &[&str]) {
        let roles = roles.iter().map(|r| r.to_string()).collect();
        self.users.write().await.push((user, roles));
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn users_in_roles(&self, roles: &[String]) -> Result<Vec<User>, CoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .filter(|(_, member_of)| member_of.iter().any(|r| roles.contains(r)))
            .map(|(user, _)| user.clone())
            .collect())
    }

    async fn find_users(&self, ids_or_usernames: &[String]) -> Result<Vec<User>, CoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .map(|(user, _)| user)
            .filter(|user| {
                ids_or_usernames
                    .iter()
                    .any(|k| &user.id == k || user.username.as_ref() == Some(k))
            })
            .cloned()
            .collect())
    }
}

/// HTTP client that replays queued responses and records requests
#[derive(Default)]
pub struct StubHttpClient {
    responses: RwLock<VecDeque<HttpResponse>>,
    requests: RwLock<Vec<HttpRequest>>,
}

impl StubHttpClient {
    /// Queue the next response
    pub async fn respond(&self, status: u16, body: Value) {
        self.responses.write().await.push_back(HttpResponse {
            status,
            headers: Default::default(),
            body: body.to_string(),
        });
    }

    /// Requests sent so far
    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl HttpClient for StubHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError> {
        self.requests.write().await.push(request);
        let queued = self.responses.write().await.pop_front();
        Ok(queued.unwrap_or_else(|| HttpResponse {
            status: 200,
            headers: Default::default(),
            body: json!({}).to_string(),
        }))
    }
}

/// Every in-memory port, shared behind `Arc`s
#[derive(Clone, Default)]
pub struct InMemoryServices {
    /// Object store
    pub objects: Arc<InMemoryObjectStore>,
    /// Secret store
    pub secrets: Arc<InMemorySecretStore>,
    /// Service dispatch
    pub dispatch: Arc<InMemoryServiceDispatch>,
    /// Broadcaster
    pub broadcaster: Arc<InMemoryBroadcaster>,
    /// User directory
    pub users: Arc<InMemoryUserDirectory>,
    /// HTTP client
    pub http: Arc<StubHttpClient>,
}

impl InMemoryServices {
    /// Create an empty set of ports
    pub fn new() -> Self {
        Self::default()
    }

    /// The ports as the core's service bundle
    pub fn services(&self) -> Services {
        Services {
            objects: self.objects.clone(),
            secrets: self.secrets.clone(),
            dispatch: self.dispatch.clone(),
            broadcaster: self.broadcaster.clone(),
            users: self.users.clone(),
            http: self.http.clone(),
        }
    }
}
