use super::template::render;
use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::domain::ports::HttpRequest;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP task configuration; every string is a template
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Method
    #[serde(default = "default_method")]
    pub method: String,
    /// URL template
    pub url: String,
    /// Header templates
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template
    #[serde(default)]
    pub body: Option<String>,
}

/// Renders a request from templates, issues it, and stores the raw response
#[derive(Debug)]
pub struct HttpTask {
    node: TaskNode,
    config: HttpConfig,
}

impl HttpTask {
    /// Create an HTTP task
    pub fn new(node: TaskNode, config: HttpConfig) -> Self {
        Self { node, config }
    }

    async fn build_request(
        &self,
        instance: &Instance,
        ctx: &RequestContext,
    ) -> Result<HttpRequest, CoreError> {
        let id = &self.node.id;
        let url = render(&self.config.url, id, instance, ctx).await?;
        let mut headers = BTreeMap::new();
        for (name, template) in &self.config.headers {
            headers.insert(name.clone(), render(template, id, instance, ctx).await?);
        }
        let body = match &self.config.body {
            Some(template) => Some(render(template, id, instance, ctx).await?),
            None => None,
        };
        Ok(HttpRequest {
            method: self.config.method.to_uppercase(),
            url,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Task for HttpTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let request = self.build_request(instance, ctx).await?;
        self.log(instance, &format!("{} {}", request.method, request.url));

        let response = ctx.services.http.send(request).await?;
        let body = serde_json::from_str::<Value>(&response.body)
            .unwrap_or_else(|_| Value::String(response.body.clone()));

        let data = json!({
            "status": response.status,
            "headers": response.headers,
            "body": body,
        });
        if let Value::Object(map) = data {
            self.state_update(instance, map);
        }

        if response.status >= 400 {
            return Err(CoreError::RemoteServiceError(format!(
                "HTTP {} from {}",
                response.status, self.node.name
            )));
        }
        Ok(true)
    }
}
