//! Redis Pub/Sub round-trip latency scenario: each virtual user publishes a
//! burst of timestamped messages on a shared channel and measures how long
//! its own messages take to come back through a dedicated subscription.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tracing::debug;

use crate::counters::CounterBag;
use crate::errors::ScenarioError;
use crate::job::UserContext;
use crate::scenario::Scenario;

const CHANNEL: &str = "sigbench";

#[derive(Serialize, Deserialize)]
struct PubSubMessage {
    uid: String,
    timestamp_nanos: i64,
}

fn now_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

fn bucket_key(latency_ms: i64) -> &'static str {
    if latency_ms < 100 {
        "redis:pubsub:latency:<100"
    } else if latency_ms < 500 {
        "redis:pubsub:latency:<500"
    } else if latency_ms < 1000 {
        "redis:pubsub:latency:<1000"
    } else {
        "redis:pubsub:latency:>=1000"
    }
}

pub struct RedisPubSub {
    counters: CounterBag,
    connection: OnceCell<ConnectionManager>,
    client: OnceCell<redis::Client>,
}

impl Default for RedisPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisPubSub {
    pub fn new() -> Self {
        Self {
            counters: CounterBag::new(),
            connection: OnceCell::new(),
            client: OnceCell::new(),
        }
    }

    fn record_latency(&self, latency_ms: i64) {
        self.counters.incr(bucket_key(latency_ms));
    }

    async fn publish_connection(&self) -> Result<ConnectionManager, ScenarioError> {
        self.connection
            .get()
            .cloned()
            .ok_or_else(|| ScenarioError::Setup("redis pool not initialised; setup() must run first".into()))
    }
}

#[async_trait]
impl Scenario for RedisPubSub {
    fn name(&self) -> &str {
        "redis:pubsub"
    }

    async fn setup(&self, params: &HashMap<String, String>) -> Result<(), ScenarioError> {
        let host = params
            .get("host")
            .ok_or_else(|| ScenarioError::Setup("missing host param".into()))?;

        let url = match params.get("password").filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{password}@{host}"),
            None => format!("redis://{host}"),
        };

        let client = redis::Client::open(url).map_err(ScenarioError::from)?;
        let manager = ConnectionManager::new(client.clone()).await.map_err(ScenarioError::from)?;

        self.client.set(client).ok();
        self.connection.set(manager).ok();
        Ok(())
    }

    async fn execute(&self, ctx: &UserContext) -> Result<(), ScenarioError> {
        self.counters.incr("redis:pubsub:inprogress");
        let result = self.run_session(ctx).await;
        self.counters.add("redis:pubsub:inprogress", -1);

        match result {
            Ok(()) => {
                self.counters.incr("redis:pubsub:success");
                Ok(())
            }
            Err(err) => {
                debug!(user = %ctx.user_id, %err, "redis pubsub session failed");
                self.counters.incr("redis:pubsub:error");
                Err(err)
            }
        }
    }

    fn counters(&self) -> HashMap<String, i64> {
        self.counters.snapshot()
    }
}

impl RedisPubSub {
    async fn run_session(&self, ctx: &UserContext) -> Result<(), ScenarioError> {
        let broadcast_duration_secs: i64 = ctx
            .params
            .get("broadcastDurationSecs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let publish_interval_micros: i64 = ctx
            .params
            .get("publishInterval")
            .ok_or_else(|| ScenarioError::Setup("missing publishInterval param".into()))?
            .parse()
            .map_err(|_| ScenarioError::Setup("publishInterval is not a valid integer".into()))?;

        let total_messages = (broadcast_duration_secs * 1_000_000 / publish_interval_micros).max(0) as usize;

        let client = self
            .client
            .get()
            .cloned()
            .ok_or_else(|| ScenarioError::Setup("redis client not initialised; setup() must run first".into()))?;

        let (tx, mut rx) = mpsc::channel::<i64>(total_messages.max(1));
        let user_id = ctx.user_id.clone();
        let mut pubsub = client.get_async_pubsub().await.map_err(ScenarioError::from)?;
        pubsub.subscribe(CHANNEL).await.map_err(ScenarioError::from)?;

        let subscriber_user_id = user_id.clone();
        let mut stream = pubsub.into_on_message();
        let reader = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(msg) = stream.next().await {
                let Ok(payload): Result<String, _> = msg.get_payload() else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<PubSubMessage>(&payload) else {
                    continue;
                };
                if parsed.uid == subscriber_user_id {
                    let latency_ms = (now_nanos() - parsed.timestamp_nanos) / 1_000_000;
                    if tx.send(latency_ms).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.counters.incr("redis:pubsub:connected");

        let mut conn = self.publish_connection().await?;
        for _ in 0..total_messages {
            let payload = serde_json::to_string(&PubSubMessage {
                uid: user_id.clone(),
                timestamp_nanos: now_nanos(),
            })?;
            let _: i64 = conn.publish(CHANNEL, payload).await.map_err(ScenarioError::from)?;
            self.counters.incr("redis:pubsub:messages:send");
            if publish_interval_micros > 0 {
                tokio::time::sleep(Duration::from_micros(publish_interval_micros as u64)).await;
            }
        }

        self.counters.add("redis:pubsub:connected", -1);

        let mut received = 0usize;
        let deadline = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(deadline);
        let outcome = loop {
            if received >= total_messages {
                break Ok(());
            }
            tokio::select! {
                latency = rx.recv() => {
                    match latency {
                        Some(latency_ms) => {
                            self.counters.incr("redis:pubsub:messages:recv");
                            self.record_latency(latency_ms);
                            received += 1;
                        }
                        None => break Err(ScenarioError::Timeout("redis pubsub subscriber channel closed")),
                    }
                }
                _ = &mut deadline => {
                    self.counters.incr("redis:pubsub:error:notrecvall");
                    break Err(ScenarioError::Timeout("redis pubsub round trip"));
                }
            }
        };

        reader.abort();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_matches_four_bucket_shape() {
        assert_eq!(bucket_key(0), "redis:pubsub:latency:<100");
        assert_eq!(bucket_key(99), "redis:pubsub:latency:<100");
        assert_eq!(bucket_key(100), "redis:pubsub:latency:<500");
        assert_eq!(bucket_key(499), "redis:pubsub:latency:<500");
        assert_eq!(bucket_key(500), "redis:pubsub:latency:<1000");
        assert_eq!(bucket_key(999), "redis:pubsub:latency:<1000");
        assert_eq!(bucket_key(1000), "redis:pubsub:latency:>=1000");
    }

    #[test]
    fn record_latency_increments_expected_counter() {
        let scenario = RedisPubSub::new();
        scenario.record_latency(42);
        scenario.record_latency(1200);
        let counters = scenario.counters();
        assert_eq!(counters.get("redis:pubsub:latency:<100"), Some(&1));
        assert_eq!(counters.get("redis:pubsub:latency:>=1000"), Some(&1));
    }
}
