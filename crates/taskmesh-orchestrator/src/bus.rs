use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{MeshError, MeshResult};
use tokio::sync::mpsc;
use tracing::debug;

/// Prefix of the per-agent request topics.
pub const TASK_TOPIC_PREFIX: &str = "tasks.";
/// Default topic agents publish their results to.
pub const DEFAULT_RESULTS_TOPIC: &str = "task-results";

/// The topic carrying task requests for one agent.
pub fn agent_topic(app_id: &str) -> String {
    format!("{TASK_TOPIC_PREFIX}{app_id}")
}

/// Reduce a CloudEvents envelope, as a pub/sub sidecar delivers it, to its
/// `data`. A JSON string in `data` is parsed. Other values pass through.
pub fn unwrap_cloud_event(value: Value) -> Value {
    match value {
        Value::Object(mut event) if event.contains_key("specversion") => {
            match event.remove("data") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw))
                }
                Some(data) => data,
                None => Value::Object(event),
            }
        }
        other => other,
    }
}

/// At-least-once publish side of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one JSON envelope to `topic`.
    async fn publish(&self, topic: &str, envelope: &Value) -> MeshResult<()>;
}

/// In-process bus: every subscriber of a topic gets its own channel.
///
/// Messages published to a topic nobody subscribes to are dropped.
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl InMemoryBus {
    /// A bus with no subscribers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive every later publish to `topic`. A topic may have many subscribers.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "Subscribed to topic");
        rx
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: &Value) -> MeshResult<()> {
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(subs) => {
                subs.retain(|tx| tx.send(envelope.clone()).is_ok());
                if subs.is_empty() {
                    debug!(topic, "All subscribers gone; message dropped");
                }
            }
            None => debug!(topic, "No subscribers; message dropped"),
        }
        Ok(())
    }
}

/// Publishes through a pub/sub sidecar's HTTP API:
/// `POST {base}/v1.0/publish/{pubsub}/{topic}`.
pub struct SidecarBus {
    client: reqwest::Client,
    base_url: String,
    pubsub_name: String,
}

impl SidecarBus {
    /// `base_url` is the sidecar HTTP address, e.g. `http://localhost:3500`.
    pub fn new(base_url: impl Into<String>, pubsub_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pubsub_name: pubsub_name.into(),
        }
    }

    fn publish_url(&self, topic: &str) -> String {
        format!(
            "{}/v1.0/publish/{}/{}",
            self.base_url, self.pubsub_name, topic
        )
    }
}

#[async_trait]
impl MessageBus for SidecarBus {
    async fn publish(&self, topic: &str, envelope: &Value) -> MeshResult<()> {
        let resp = self
            .client
            .post(self.publish_url(topic))
            .json(envelope)
            .send()
            .await
            .map_err(|e| MeshError::Bus(format!("publish to '{topic}' failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MeshError::Bus(format!(
                "publish to '{topic}' rejected with {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_agent_topic() {
        assert_eq!(agent_topic("reviewer-a"), "tasks.reviewer-a");
    }

    #[test]
    fn test_unwrap_cloud_event() {
        let inner = json!({"taskId": "t", "agentId": "a", "success": true});
        let event = json!({
            "specversion": "1.0",
            "type": "com.dapr.event.sent",
            "source": "agent-a",
            "id": "5929aaac",
            "datacontenttype": "application/json",
            "data": inner.clone(),
        });
        assert_eq!(unwrap_cloud_event(event), inner);

        let stringly = json!({"specversion": "1.0", "data": inner.to_string()});
        assert_eq!(unwrap_cloud_event(stringly), inner);

        assert_eq!(unwrap_cloud_event(inner.clone()), inner);
    }

    #[tokio::test]
    async fn test_in_memory_fan_out() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe("tasks.a");
        let mut second = bus.subscribe("tasks.a");
        let mut other = bus.subscribe("tasks.b");

        bus.publish("tasks.a", &json!({"n": 1})).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(second.recv().await.unwrap(), json!({"n": 1}));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_in_memory_prunes_closed_subscribers() {
        let bus = InMemoryBus::new();
        let rx = bus.subscribe("tasks.a");
        assert_eq!(bus.subscriber_count("tasks.a"), 1);
        drop(rx);
        bus.publish("tasks.a", &json!({})).await.unwrap();
        assert_eq!(bus.subscriber_count("tasks.a"), 0);
        // Unknown topics are fine too.
        bus.publish("tasks.nobody", &json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_sidecar_publish() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/publish/pubsub/tasks.a"))
            .and(body_json(json!({"id": 1})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let bus = SidecarBus::new(format!("{}/", server.uri()), "pubsub");
        bus.publish("tasks.a", &json!({"id": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn test_sidecar_rejection_is_bus_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let bus = SidecarBus::new(server.uri(), "pubsub");
        let err = bus.publish("tasks.a", &json!({})).await.unwrap_err();
        assert!(matches!(err, MeshError::Bus(_)));
        assert!(err.is_retryable());
    }
}
