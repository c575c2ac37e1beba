use super::template::render;
use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::domain::ports::channels;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Email task configuration; every field is a template
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Recipient
    pub to: String,
    /// Sender
    pub from: String,
    /// Subject
    pub subject: String,
    /// HTML body
    pub html: String,
}

/// Sends one email through the email channel
#[derive(Debug)]
pub struct EmailTask {
    node: TaskNode,
    config: EmailConfig,
}

impl EmailTask {
    /// Create an email task
    pub fn new(node: TaskNode, config: EmailConfig) -> Self {
        Self { node, config }
    }
}

#[async_trait]
impl Task for EmailTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let id = &self.node.id;
        let to = render(&self.config.to, id, instance, ctx).await?;
        let payload = json!({
            "to": to,
            "from": render(&self.config.from, id, instance, ctx).await?,
            "subject": render(&self.config.subject, id, instance, ctx).await?,
            "html": render(&self.config.html, id, instance, ctx).await?,
        });

        let reply = ctx
            .services
            .dispatch
            .request(channels::EMAIL_SEND, payload)
            .await?;

        self.log(instance, &format!("Email sent to {}", to));
        let mut data = Map::new();
        data.insert("to".to_string(), Value::String(to));
        data.insert("reply".to_string(), reply);
        self.state_update(instance, data);
        Ok(true)
    }
}
