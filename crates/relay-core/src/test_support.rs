//! In-crate fakes for unit tests.

use crate::application::context::{EngineConfig, RequestContext, RetryPolicy, Services};
use crate::domain::definition::{DefinitionId, TaskId};
use crate::domain::instance::{Instance, InstanceKey};
use crate::domain::ports::*;
use crate::domain::reference::References;
use crate::CoreError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeObjectStore {
    pub types: Mutex<HashMap<String, ObjectType>>,
    pub rows: Mutex<HashMap<String, Vec<Value>>>,
    pub procedures: Mutex<Vec<(String, Vec<Value>)>>,
    pub procedure_errors: Mutex<VecDeque<CoreError>>,
    pub find_errors: Mutex<VecDeque<CoreError>>,
    pub updates: Mutex<usize>,
}

impl FakeObjectStore {
    pub fn define(&self, object: ObjectType, rows: Vec<Value>) {
        self.rows.lock().unwrap().insert(object.id.clone(), rows);
        self.types.lock().unwrap().insert(object.id.clone(), object);
    }

    pub fn rows(&self, object: &str) -> Vec<Value> {
        self.rows.lock().unwrap().get(object).cloned().unwrap_or_default()
    }

    fn matches(row: &Value, condition: &Condition) -> bool {
        match condition {
            Condition::Eq { column, value } => row.get(column) == Some(value),
            Condition::In { column, values } => {
                row.get(column).map_or(false, |v| values.contains(v))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn object_type(&self, object_id: &str) -> Result<Option<ObjectType>, CoreError> {
        Ok(self.types.lock().unwrap().get(object_id).cloned())
    }

    async fn find<'a>(
        &self,
        query: &RecordQuery,
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Vec<Value>, CoreError> {
        if let Some(err) = self.find_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .rows(&query.object)
            .into_iter()
            .filter(|row| query.conditions.iter().all(|c| Self::matches(row, c)))
            .collect())
    }

    async fn update<'a>(
        &self,
        object_id: &str,
        id: &Value,
        values: &Map<String, Value>,
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        let pk = self
            .types
            .lock()
            .unwrap()
            .get(object_id)
            .map(|t| t.primary_key.clone())
            .unwrap_or_else(|| "id".to_string());
        let mut rows = self.rows.lock().unwrap();
        let table = rows.entry(object_id.to_string()).or_default();
        let row = table
            .iter_mut()
            .find(|r| r.get(&pk) == Some(id))
            .ok_or_else(|| CoreError::Other(format!("no row {}", id)))?;
        if let Value::Object(map) = row {
            for (k, v) in values {
                map.insert(k.clone(), v.clone());
            }
        }
        *self.updates.lock().unwrap() += 1;
        Ok(row.clone())
    }

    async fn call_procedure<'a>(
        &self,
        name: &str,
        args: &[Value],
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        self.procedures
            .lock()
            .unwrap()
            .push((name.to_string(), args.to_vec()));
        match self.procedure_errors.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(json!({"ok": true})),
        }
    }
}

#[derive(Default)]
pub struct FakeSecrets(Mutex<HashMap<(String, String), String>>);

impl FakeSecrets {
    pub fn insert(&self, owner: &str, name: &str, value: &str) {
        self.0
            .lock()
            .unwrap()
            .insert((owner.to_string(), name.to_string()), value.to_string());
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn get_value(&self, owner_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .get(&(owner_id.to_string(), name.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct FakeDispatch {
    pub replies: Mutex<HashMap<String, VecDeque<Result<Value, CoreError>>>>,
    pub requests: Mutex<Vec<(String, Value)>>,
}

impl FakeDispatch {
    pub fn reply(&self, channel: &str, reply: Result<Value, CoreError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn sent(&self, channel: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ServiceDispatch for FakeDispatch {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, CoreError> {
        self.requests
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        self.replies
            .lock()
            .unwrap()
            .get_mut(channel)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(json!({})))
    }
}

#[derive(Default)]
pub struct FakeBroadcaster {
    pub pushes: Mutex<Vec<(String, Value)>>,
    pub broadcasts: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn push_to_user(&self, user_id: &str, payload: Value) -> Result<(), CoreError> {
        self.pushes
            .lock()
            .unwrap()
            .push((user_id.to_string(), payload));
        Ok(())
    }

    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), CoreError> {
        self.broadcasts
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUsers(pub Mutex<Vec<(User, Vec<String>)>>);

impl FakeUsers {
    pub fn add(&self, id: &str, username: &str, roles: &[&str]) {
        self.0.lock().unwrap().push((
            User {
                id: id.to_string(),
                username: Some(username.to_string()),
                email: None,
            },
            roles.iter().map(|r| r.to_string()).collect(),
        ));
    }
}

#[async_trait]
impl UserDirectory for FakeUsers {
    async fn users_in_roles(&self, roles: &[String]) -> Result<Vec<User>, CoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.iter().any(|role| roles.contains(role)))
            .map(|(u, _)| u.clone())
            .collect())
    }

    async fn find_users(&self, ids_or_usernames: &[String]) -> Result<Vec<User>, CoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|(u, _)| u)
            .filter(|u| {
                ids_or_usernames
                    .iter()
                    .any(|k| &u.id == k || u.username.as_ref() == Some(k))
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeHttp {
    pub requests: Mutex<Vec<HttpRequest>>,
    pub responses: Mutex<VecDeque<HttpResponse>>,
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError> {
        self.requests.lock().unwrap().push(request);
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HttpResponse {
                status: 200,
                headers: Default::default(),
                body: "{}".to_string(),
            }))
    }
}

pub struct Fixture {
    pub objects: Arc<FakeObjectStore>,
    pub secrets: Arc<FakeSecrets>,
    pub dispatch: Arc<FakeDispatch>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub users: Arc<FakeUsers>,
    pub http: Arc<FakeHttp>,
    pub labels: HashMap<String, TaskId>,
}

impl Fixture {
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

    pub fn ctx(&self) -> RequestContext {
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                backoff_multiplier: 1.0,
                max_delay_ms: 1,
            },
            ..EngineConfig::default()
        };
        RequestContext::new(self.services(), config)
            .with_references(References::new(self.labels.clone()))
    }

    pub fn label(&mut self, label: &str, task: &str) {
        self.labels.insert(label.to_string(), TaskId::new(task));
        self.labels.insert(task.to_string(), TaskId::new(task));
    }

    pub fn instance(&self) -> Instance {
        Instance::new(
            DefinitionId("sha256:test".to_string()),
            InstanceKey("key-1".to_string()),
            json!({}),
        )
    }

    /// Complete a task with the given data
    pub fn seed(&self, instance: &mut Instance, task: &str, data: Value) {
        let id = TaskId::new(task);
        if let Value::Object(map) = data {
            instance.state_update(&id, map);
        }
        instance.state_completed(&id);
    }
}

pub fn fixture() -> Fixture {
    let mut fx = Fixture {
        objects: Arc::default(),
        secrets: Arc::default(),
        dispatch: Arc::default(),
        broadcaster: Arc::default(),
        users: Arc::default(),
        http: Arc::default(),
        labels: HashMap::new(),
    };
    fx.label("Trigger", "t1");
    fx
}

pub fn object(id: &str, fields: Value) -> ObjectType {
    serde_json::from_value(json!({"id": id, "name": id, "fields": fields}))
        .expect("valid object type")
}
