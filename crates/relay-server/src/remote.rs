//! Outbound adapters over `reqwest`: the HTTP task transport, and service
//! dispatch / broadcast through the service gateway at `service_url`.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use relay_core::{
    domain::ports::{Broadcaster, HttpClient, HttpRequest, HttpResponse, ServiceDispatch},
    CoreError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn map_reqwest_error(operation: &str, err: reqwest::Error) -> CoreError {
    if err.is_connect() || err.is_timeout() {
        CoreError::Transient(format!("{}: {}", operation, err))
    } else {
        CoreError::RemoteServiceError(format!("{}: {}", operation, err))
    }
}

fn build_client() -> Result<Client, CoreError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CoreError::Other(format!("HTTP client: {}", e)))
}

/// HTTP transport for the HTTP/API task
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a client with the default timeout
    pub fn new() -> Result<Self, CoreError> {
        Ok(Self {
            client: build_client()?,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|_| {
            CoreError::ConfigurationError(format!("Invalid HTTP method: {}", request.method))
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&request.url, e))?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(&request.url, e))?;

        debug!(url = %request.url, status, "HTTP call finished");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Service dispatch and broadcast over the service gateway.
///
/// A request on channel `c` is `POST {base}/services/{c}` with the payload as
/// body; the reply is the JSON response. Replies with a non-success status or
/// a non-null `error` member are remote-service errors.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    /// Create a gateway client for a base URL
    pub fn new(base_url: &str) -> Result<Self, CoreError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value, CoreError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| map_reqwest_error(path, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(path, e))?;
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "Gateway replied with an error status");
            return Err(CoreError::RemoteServiceError(format!(
                "{} replied {}: {}",
                path, status, text
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let reply: Value = serde_json::from_str(&text)?;
        match reply.get("error") {
            Some(err) if !err.is_null() => Err(CoreError::RemoteServiceError(format!(
                "{}: {}",
                path,
                err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string())
            ))),
            _ => Ok(reply),
        }
    }
}

#[async_trait]
impl ServiceDispatch for GatewayClient {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, CoreError> {
        debug!(channel, "Dispatching service request");
        self.post(&format!("services/{}", channel), &payload).await
    }
}

#[async_trait]
impl Broadcaster for GatewayClient {
    async fn push_to_user(&self, user_id: &str, payload: Value) -> Result<(), CoreError> {
        self.post(&format!("push/{}", user_id), &payload).await?;
        Ok(())
    }

    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), CoreError> {
        self.post(
            "broadcast",
            &json!({ "channel": channel, "payload": payload }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_dispatch_returns_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/userForm.create"))
            .and(body_json(json!({"name": "approve"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uuid": "f-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = GatewayClient::new(&format!("{}/", server.uri())).unwrap();
        let reply = gateway
            .request("userForm.create", json!({"name": "approve"}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"uuid": "f-1"}));
    }

    #[tokio::test]
    async fn test_error_reply_is_remote_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/email"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "bounced"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let gateway = GatewayClient::new(&server.uri()).unwrap();
        let err = gateway.request("email", json!({})).await.unwrap_err();
        assert_eq!(err, CoreError::RemoteServiceError("services/email: bounced".into()));
        let err = gateway.request("status", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::RemoteServiceError(_)));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let gateway = GatewayClient::new("http://127.0.0.1:9").unwrap();
        let err = gateway.request("email", json!({})).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_client_returns_raw_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/crm/contacts"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("x-trace", "t-1")
                    .set_body_string("missing"),
            )
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new().unwrap();
        let response = client
            .send(HttpRequest {
                method: "put".into(),
                url: format!("{}/crm/contacts", server.uri()),
                headers: BTreeMap::from([("authorization".to_string(), "Bearer abc".to_string())]),
                body: Some("{}".into()),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, "missing");
        assert_eq!(response.headers.get("x-trace").map(String::as_str), Some("t-1"));
    }
}
