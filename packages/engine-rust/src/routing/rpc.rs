//! Remote-call operator and its pluggable transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use relay_core::{Message, Properties};
use serde::{Deserialize, Serialize};

use super::operator::Verdict;

/// Reply from a remote service. `None` body leaves the message body as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcReply {
    pub body: Option<Vec<u8>>,
    pub properties: Properties,
}

/// Transport used by `rpc` operators.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, endpoint: &str, request: &Message) -> anyhow::Result<RpcReply>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest<'a> {
    topic: &'a str,
    body: String,
    properties: &'a Properties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpResponse {
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    properties: Properties,
}

/// Posts the message as JSON (`topic`, base64 `body`, `properties`) and
/// expects the same shape back, with `body` optional.
#[derive(Debug, Clone, Default)]
pub struct HttpRpcClient {
    client: reqwest::Client,
}

impl HttpRpcClient {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, endpoint: &str, request: &Message) -> anyhow::Result<RpcReply> {
        let payload = HttpRequest {
            topic: &request.topic,
            body: STANDARD.encode(&request.body),
            properties: &request.properties,
        };
        let response: HttpResponse = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let body = response
            .body
            .map(|b| STANDARD.decode(b))
            .transpose()
            .context("reply body is not valid base64")?;
        Ok(RpcReply {
            body,
            properties: response.properties,
        })
    }
}

// ---------------------------------------------------------------------------
// Operator evaluator
// ---------------------------------------------------------------------------

pub(crate) struct RpcCall {
    endpoint: String,
    client: Arc<dyn RpcClient>,
    timeout: Duration,
    response_property: Option<String>,
}

impl RpcCall {
    pub(crate) fn new(
        endpoint: String,
        client: Arc<dyn RpcClient>,
        timeout: Duration,
        response_property: Option<String>,
    ) -> Self {
        Self {
            endpoint,
            client,
            timeout,
            response_property,
        }
    }

    /// Reply properties overwrite message properties. The reply body replaces
    /// the message body, or is stored in `response_property` when one is set.
    pub(crate) async fn evaluate(&self, message: Message) -> anyhow::Result<Verdict> {
        let call = self.client.call(&self.endpoint, &message);
        let reply = match tokio::time::timeout(self.timeout, call).await {
            Ok(reply) => reply.with_context(|| format!("call to `{}` failed", self.endpoint))?,
            Err(_) => bail!(
                "call to `{}` timed out after {}ms",
                self.endpoint,
                self.timeout.as_millis()
            ),
        };
        let mut message = message;
        message.properties.extend(reply.properties);
        if let Some(body) = reply.body {
            match &self.response_property {
                Some(key) => {
                    message
                        .properties
                        .insert(key.clone(), String::from_utf8_lossy(&body).into_owned());
                }
                None => message.body = body,
            }
        }
        Ok(Verdict::Forward(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcClient for Echo {
        async fn call(&self, endpoint: &str, request: &Message) -> anyhow::Result<RpcReply> {
            let mut properties = Properties::new();
            properties.insert("endpoint".to_string(), endpoint.to_string());
            Ok(RpcReply {
                body: Some(request.body.iter().rev().copied().collect()),
                properties,
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl RpcClient for Slow {
        async fn call(&self, _endpoint: &str, _request: &Message) -> anyhow::Result<RpcReply> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RpcReply::default())
        }
    }

    struct Failing;

    #[async_trait]
    impl RpcClient for Failing {
        async fn call(&self, _endpoint: &str, _request: &Message) -> anyhow::Result<RpcReply> {
            bail!("connection refused")
        }
    }

    fn call(client: Arc<dyn RpcClient>, response_property: Option<&str>) -> RpcCall {
        RpcCall::new(
            "enrich".to_string(),
            client,
            Duration::from_millis(200),
            response_property.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn reply_replaces_body_and_merges_properties() {
        let rpc = call(Arc::new(Echo), None);
        let Verdict::Forward(out) = rpc.evaluate(Message::new("t", "abc")).await.unwrap() else {
            panic!("rpc forwards");
        };
        assert_eq!(out.body, b"cba");
        assert_eq!(out.property("endpoint"), Some("enrich"));
    }

    #[tokio::test]
    async fn reply_body_can_go_to_property() {
        let rpc = call(Arc::new(Echo), Some("reply"));
        let Verdict::Forward(out) = rpc.evaluate(Message::new("t", "abc")).await.unwrap() else {
            panic!("rpc forwards");
        };
        assert_eq!(out.body, b"abc");
        assert_eq!(out.property("reply"), Some("cba"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let rpc = call(Arc::new(Slow), None);
        let err = rpc.evaluate(Message::new("t", "")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let rpc = call(Arc::new(Failing), None);
        let err = rpc.evaluate(Message::new("t", "")).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
