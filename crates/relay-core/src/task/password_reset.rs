use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::domain::ports::channels;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Password-reset-URL task configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordResetConfig {
    /// Reference to the email value, e.g. `Form.email`
    pub email: String,
}

/// Mints a password-reset URL for an email taken from prior task output
#[derive(Debug)]
pub struct PasswordResetUrlTask {
    node: TaskNode,
    config: PasswordResetConfig,
}

impl PasswordResetUrlTask {
    /// Create a password-reset-URL task
    pub fn new(node: TaskNode, config: PasswordResetConfig) -> Self {
        Self { node, config }
    }
}

#[async_trait]
impl Task for PasswordResetUrlTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let email = match ctx.references.resolve(instance, &self.config.email) {
            Some(Value::String(email)) if !email.is_empty() => email,
            _ => {
                return Err(CoreError::ConfigurationError(format!(
                    "Email reference '{}' did not resolve to an address",
                    self.config.email
                )))
            }
        };

        let reply = ctx
            .services
            .dispatch
            .request(channels::PASSWORD_RESET_URL, json!({ "email": email }))
            .await?;
        let url = reply
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::RemoteServiceError("Password reset reply carried no url".to_string())
            })?
            .to_string();

        self.log(instance, &format!("Minted password reset URL for {}", email));
        let mut data = Map::new();
        data.insert("email".to_string(), Value::String(email));
        data.insert("url".to_string(), Value::String(url));
        self.state_update(instance, data);
        Ok(true)
    }
}
