//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Request/reply over topics.
//!
//! ```text
//! request  -> <target>/rpc/services/<address>  {"input": .., "replyTopic": ..}
//! reply    -> <caller>/rpc/replies/<id>         {"output": ..} | {"error": {"message", "stacktrace"}}
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use r_bus_common::RpcConfig;
use r_bus_types::{decode_json, encode_json};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{Client, Subscription};
use crate::{topic, BusError, Result};

const REPLY_ID_LEN: usize = 16;

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Service input.
    #[serde(default)]
    pub input: Value,
    /// Topic the reply is published to.
    pub reply_topic: String,
}

/// Reply envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

/// Error carried inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Top-level message.
    pub message: String,
    /// Full error chain.
    pub stacktrace: String,
}

/// Handler bound to an rpc address.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one request.
    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> RpcService for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        (self)(input).await
    }
}

enum ServiceSlot {
    Reserved,
    Running(JoinHandle<()>),
}

/// Hosts rpc services for the own instance.
pub struct RpcServer {
    client: Client,
    services: Arc<Mutex<HashMap<String, ServiceSlot>>>,
}

impl RpcServer {
    /// Server publishing replies through `client`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            services: Arc::default(),
        }
    }

    /// Bind `service` to `<self>/rpc/services/<address>`.
    pub async fn register<S: RpcService>(&self, address: &str, service: S) -> Result<()> {
        {
            let mut services = self.services.lock();
            if services.contains_key(address) {
                return Err(BusError::DuplicateService {
                    address: address.to_owned(),
                });
            }
            services.insert(address.to_owned(), ServiceSlot::Reserved);
        }

        let subscription = match self
            .client
            .subscribe(&topic::rpc_service(self.client.instance_name(), address))
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.services.lock().remove(address);
                return Err(err);
            }
        };

        let handle = tokio::spawn(serve(
            self.client.clone(),
            address.to_owned(),
            subscription,
            Arc::new(service),
        ));
        let mut services = self.services.lock();
        match services.get_mut(address) {
            Some(slot) => *slot = ServiceSlot::Running(handle),
            None => handle.abort(),
        }
        debug!(address, "rpc service registered");
        Ok(())
    }

    /// Remove the service at `address`.
    pub fn unregister(&self, address: &str) -> Result<()> {
        match self.services.lock().remove(address) {
            Some(ServiceSlot::Running(handle)) => {
                handle.abort();
                Ok(())
            }
            Some(ServiceSlot::Reserved) => Ok(()),
            None => Err(BusError::UnknownService {
                address: address.to_owned(),
            }),
        }
    }

    /// Registered addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.services.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        for (_, slot) in self.services.lock().drain() {
            if let ServiceSlot::Running(handle) = slot {
                handle.abort();
            }
        }
    }
}

async fn serve(
    client: Client,
    address: String,
    mut subscription: Subscription,
    service: Arc<dyn RpcService>,
) {
    while let Some(message) = subscription.recv().await {
        if message.is_tombstone() {
            continue;
        }
        let request: RpcRequest = match decode_json(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(address = %address, error = %err, "discarding malformed rpc request");
                continue;
            }
        };
        let client = client.clone();
        let service = service.clone();
        let address = address.clone();
        tokio::spawn(async move {
            let response = match service.call(request.input).await {
                Ok(output) => RpcResponse {
                    output: Some(output),
                    error: None,
                },
                Err(err) => RpcResponse {
                    output: None,
                    error: Some(RemoteFault {
                        message: err.to_string(),
                        stacktrace: format!("{err:?}"),
                    }),
                },
            };
            let sent = encode_json(&response)
                .map_err(BusError::from)
                .and_then(|payload| client.publish(&request.reply_topic, payload, false));
            if let Err(err) = sent {
                warn!(address = %address, reply_topic = %request.reply_topic, error = %err, "rpc reply failed");
            }
        });
    }
}

/// Issues rpc calls from the own instance.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    timeout: Duration,
}

impl RpcClient {
    /// Caller using the configured default timeout.
    pub fn new(client: Client, config: &RpcConfig) -> Self {
        Self {
            client,
            timeout: config.call_timeout,
        }
    }

    /// Call `address` on `target` with the default timeout.
    pub async fn call(&self, target: &str, address: &str, input: Value) -> Result<Value> {
        self.call_with_timeout(target, address, input, self.timeout)
            .await
    }

    /// Call with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        address: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let reply_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REPLY_ID_LEN)
            .map(char::from)
            .collect();
        let reply_topic = topic::rpc_reply(self.client.instance_name(), &reply_id);
        let service_topic = topic::rpc_service(target, address);

        let mut subscription = self.client.subscribe(&reply_topic).await?;
        let request = RpcRequest {
            input,
            reply_topic,
        };
        self.client
            .publish(&service_topic, encode_json(&request)?, false)?;

        let started = Instant::now();
        let reply = tokio::time::timeout(timeout, async {
            while let Some(message) = subscription.recv().await {
                if !message.is_tombstone() {
                    return Some(message);
                }
            }
            None
        })
        .await;
        drop(subscription);

        let message = match reply {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(BusError::Connection(
                    "client dropped while awaiting rpc reply".into(),
                ))
            }
            Err(_) => {
                return Err(BusError::RpcTimeout {
                    address: address.to_owned(),
                    topic: service_topic,
                    timeout,
                })
            }
        };
        self.client.observe_latency(started.elapsed());

        let response: RpcResponse = decode_json(&message.payload)?;
        match response.error {
            Some(fault) => Err(BusError::RpcRemote {
                message: fault.message,
                stacktrace: fault.stacktrace,
            }),
            None => Ok(response.output.unwrap_or(Value::Null)),
        }
    }

    /// Serialize `input`, call, deserialize the output.
    pub async fn call_typed<I, O>(&self, target: &str, address: &str, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let output = self.call(target, address, input).await?;
        Ok(serde_json::from_value(output)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelopes_use_wire_field_names() {
        let request = RpcRequest {
            input: json!({"x": 1}),
            reply_topic: "ui/rpc/replies/abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"input": {"x": 1}, "replyTopic": "ui/rpc/replies/abc"})
        );

        let failure = RpcResponse {
            output: None,
            error: Some(RemoteFault {
                message: "boom".into(),
                stacktrace: "boom\n\nCaused by: io".into(),
            }),
        };
        let encoded = serde_json::to_value(&failure).unwrap();
        assert!(encoded.get("output").is_none());
        assert_eq!(encoded["error"]["message"], "boom");
    }

    #[test]
    fn null_output_decodes_as_success() {
        let parsed: RpcResponse = serde_json::from_value(json!({"output": null})).unwrap();
        assert!(parsed.error.is_none());
        assert_eq!(parsed.output.unwrap_or(Value::Null), Value::Null);
    }
}
