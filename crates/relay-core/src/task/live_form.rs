use super::{lane_users, Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// State key set by `enter_inputs` once the form was submitted
pub const INPUTS_SET: &str = "_isSet";

const PUSHED: &str = "_pushed";

/// In-engine user form configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserFormConfig {
    /// Form definition forwarded to the client
    #[serde(default)]
    pub form: Value,
}

/// Pushes a live form request to the lane's users and waits for `enter_inputs`.
///
/// The push never completes the task; the next pass after the inputs were
/// entered does.
#[derive(Debug)]
pub struct UserFormTask {
    node: TaskNode,
    config: UserFormConfig,
}

impl UserFormTask {
    /// Create a live user form task
    pub fn new(node: TaskNode, config: UserFormConfig) -> Self {
        Self { node, config }
    }
}

#[async_trait]
impl Task for UserFormTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let state = self.my_state(instance);
        if state.get(INPUTS_SET).and_then(Value::as_bool) == Some(true) {
            // Drop the markers so a loop re-entry pushes a fresh form.
            let mut values = state.data;
            values.remove(INPUTS_SET);
            values.remove(PUSHED);
            instance.clear_data(self.id());
            self.state_update(instance, values);
            self.log(instance, "Form inputs received");
            return Ok(true);
        }
        if state.get(PUSHED).and_then(Value::as_bool) == Some(true) {
            return Ok(false);
        }

        let users = lane_users(&self.node, ctx).await?;
        if users.is_empty() {
            return Err(CoreError::ConfigurationError(format!(
                "Lane of form {} resolved to no users",
                self.node.id
            )));
        }

        let payload = json!({
            "processId": instance.definition_id.0,
            "taskId": self.node.id.0,
            "instanceId": instance.id.0,
            "formDefinition": self.config.form,
        });
        for user in &users {
            ctx.services
                .broadcaster
                .push_to_user(user, payload.clone())
                .await?;
        }

        self.log(instance, &format!("Form pushed to {} user(s)", users.len()));
        let mut data = Map::new();
        data.insert(PUSHED.to_string(), Value::Bool(true));
        self.state_update(instance, data);
        Ok(false)
    }
}
