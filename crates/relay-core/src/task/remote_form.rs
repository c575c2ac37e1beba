use super::{lane_users, Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::definition::ElementKind;
use crate::domain::instance::Instance;
use crate::domain::ports::channels;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const FORM_ID: &str = "form_id";
const PENDING: &str = "pending";

/// Configuration shared by approval and external-form tasks
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFormConfig {
    /// Form name shown to the recipients
    pub name: String,
    /// Form definition
    #[serde(default)]
    pub definition: Value,
    /// UI hints
    #[serde(default)]
    pub ui: Value,
    /// Field name -> reference into prior task output
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Explicit role recipients
    #[serde(default)]
    pub roles: Vec<String>,
    /// Explicit account recipients
    #[serde(default)]
    pub users: Vec<String>,
    /// Record scope for the form
    #[serde(default)]
    pub scope_query: Option<Value>,
}

/// Two-phase remote form: create it, then poll its status until resolved
#[derive(Debug)]
pub struct RemoteFormTask {
    node: TaskNode,
    config: RemoteFormConfig,
}

impl RemoteFormTask {
    /// Create an approval or external-form task
    pub fn new(node: TaskNode, config: RemoteFormConfig) -> Self {
        Self { node, config }
    }

    fn form_kind(&self) -> &'static str {
        match self.node.kind {
            ElementKind::UserApproval => "approval",
            _ => "external",
        }
    }

    async fn create(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let mut data = Map::new();
        for (field, reference) in &self.config.data {
            let value = ctx.references.resolve(instance, reference).unwrap_or(Value::Null);
            data.insert(field.clone(), value);
        }

        let mut payload = json!({
            "name": self.config.name,
            "kind": self.form_kind(),
            "process": instance.id.0,
            "definition": self.config.definition,
            "ui": self.config.ui,
            "data": data,
        });
        if self.config.roles.is_empty() && self.config.users.is_empty() {
            payload["users"] = json!(lane_users(&self.node, ctx).await?);
        } else {
            if !self.config.roles.is_empty() {
                payload["roles"] = json!(self.config.roles);
            }
            if !self.config.users.is_empty() {
                payload["users"] = json!(self.config.users);
            }
        }
        if let Some(scope) = &self.config.scope_query {
            payload["scopeQuery"] = scope.clone();
        }

        let reply = ctx
            .services
            .dispatch
            .request(channels::USER_FORM_CREATE, payload)
            .await?;
        let form_id = reply
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::RemoteServiceError("User form reply carried no uuid".to_string())
            })?
            .to_string();

        self.log(instance, &format!("Created {} form {}", self.form_kind(), form_id));
        let mut state = Map::new();
        state.insert(FORM_ID.to_string(), Value::String(form_id));
        self.state_update(instance, state);
        Ok(false)
    }

    async fn poll(
        &self,
        form_id: &str,
        instance: &mut Instance,
        ctx: &RequestContext,
    ) -> Result<bool, CoreError> {
        let reply = ctx
            .services
            .dispatch
            .request(channels::USER_FORM_STATUS, json!({ "uuid": form_id }))
            .await?;
        let status = reply
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or(PENDING)
            .to_string();
        if status == PENDING {
            return Ok(false);
        }

        self.log(instance, &format!("Form {} resolved: {}", form_id, status));
        // Without a form id a loop re-entry creates a fresh form.
        instance.clear_data(self.id());
        let mut state = Map::new();
        state.insert("status".to_string(), Value::String(status));
        state.insert(
            "response".to_string(),
            reply.get("response").cloned().unwrap_or(Value::Null),
        );
        state.insert(
            "responder".to_string(),
            reply.get("responder").cloned().unwrap_or(Value::Null),
        );
        self.state_update(instance, state);
        Ok(true)
    }
}

#[async_trait]
impl Task for RemoteFormTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let form_id = self
            .my_state(instance)
            .get(FORM_ID)
            .and_then(Value::as_str)
            .map(str::to_string);
        match form_id {
            Some(form_id) => self.poll(&form_id, instance, ctx).await,
            None => self.create(instance, ctx).await,
        }
    }
}
