//! Classic ASP.NET SignalR ("framework", pre-Core) broadcast-sender scenario.
//!
//! Unlike the Core transport (`signalr_core_echo`), framework SignalR uses a
//! three-step handshake — `/negotiate`, a WebSocket `/connect`, then
//! `/start` — before a hub connection is considered live. This scenario
//! sends a timestamped message once per second for `broadcastDurationSecs`
//! and waits to receive the same count of self-addressed broadcasts the
//! server echoes back, recording round-trip latency the same way the Redis
//! Pub/Sub scenario does: a fixed four-bucket shape rather than the core's
//! uniform-step histogram.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::connection_pool::{PoolConfig, GLOBAL_POOL_STATS};
use crate::counters::CounterBag;
use crate::errors::ScenarioError;
use crate::job::UserContext;
use crate::scenario::Scenario;

const TAG: &str = "signalrfx:broadcast:sender";
const DEFAULT_METHOD: &str = "broadcastMessage";

lazy_static! {
    static ref HTTP_CLIENT: reqwest::Client = PoolConfig::default()
        .apply_to_builder(reqwest::Client::builder())
        .build()
        .expect("signalr framework http client builds");
}

fn now_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

fn bucket_key(latency_ms: i64) -> &'static str {
    if latency_ms < 100 {
        "signalrfx:broadcast:sender:latency:<100"
    } else if latency_ms < 500 {
        "signalrfx:broadcast:sender:latency:<500"
    } else if latency_ms < 1000 {
        "signalrfx:broadcast:sender:latency:<1000"
    } else {
        "signalrfx:broadcast:sender:latency:>=1000"
    }
}

#[derive(Debug, Deserialize)]
struct NegotiateResponse {
    #[serde(rename = "ConnectionToken")]
    connection_token: String,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(rename = "Response")]
    response: String,
}

/// One `M`-array entry of a framework SignalR message frame:
/// `{"H":"<hub>","M":"<method>","A":[...]}`.
#[derive(Debug, Serialize, Deserialize)]
struct HubInvocation {
    #[serde(rename = "H")]
    hub: String,
    #[serde(rename = "M")]
    method: String,
    #[serde(rename = "A")]
    arguments: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ClientFrame<'a> {
    #[serde(rename = "H")]
    hub: &'a str,
    #[serde(rename = "M")]
    method: &'a str,
    #[serde(rename = "A")]
    arguments: Vec<String>,
    #[serde(rename = "I")]
    invocation_id: &'a str,
}

/// Peeks just enough of an inbound frame to tell the init ack (`{"S":1}`)
/// apart from a hub message frame (`{"M":[...]}`).
#[derive(Debug, Deserialize, Default)]
struct ServerFrame {
    #[serde(rename = "S", default)]
    init: Option<i32>,
    #[serde(rename = "M", default)]
    messages: Vec<HubInvocation>,
}

fn connection_data(hub: &str) -> String {
    format!("[{{\"name\":\"{hub}\"}}]")
}

pub struct SignalRFrameworkBroadcastSender {
    counters: CounterBag,
}

impl Default for SignalRFrameworkBroadcastSender {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRFrameworkBroadcastSender {
    pub fn new() -> Self {
        Self {
            counters: CounterBag::new(),
        }
    }

    fn record_latency(&self, latency_ms: i64) {
        self.counters.incr(bucket_key(latency_ms));
    }

    async fn negotiate(&self, host: &str, hub: &str) -> Result<String, ScenarioError> {
        let url = format!(
            "http://{host}/signalr/negotiate?clientProtocol=1.4&connectionData={}",
            urlencode(&connection_data(hub))
        );
        let start = std::time::Instant::now();
        let resp: NegotiateResponse = HTTP_CLIENT.get(&url).send().await?.json().await?;
        GLOBAL_POOL_STATS.record_request(start.elapsed().as_millis() as u64);
        Ok(resp.connection_token)
    }

    async fn start(&self, host: &str, hub: &str, token: &str) -> Result<(), ScenarioError> {
        let url = format!(
            "http://{host}/signalr/start?transport=webSockets&clientProtocol=1.4&connectionToken={}&connectionData={}",
            urlencode(token),
            urlencode(&connection_data(hub)),
        );
        let start = std::time::Instant::now();
        let resp: StartResponse = HTTP_CLIENT.get(&url).send().await?.json().await?;
        GLOBAL_POOL_STATS.record_request(start.elapsed().as_millis() as u64);
        if resp.response != "started" {
            return Err(ScenarioError::Protocol(format!(
                "unexpected /signalr/start response: {:?}",
                resp.response
            )));
        }
        Ok(())
    }

    async fn run_session(&self, ctx: &UserContext) -> Result<(), ScenarioError> {
        let host = ctx
            .params
            .get("host")
            .ok_or_else(|| ScenarioError::Setup("missing host param".into()))?;
        let hub = ctx.params.get("hub").map(String::as_str).unwrap_or("chat");
        let method = ctx.params.get("method").map(String::as_str).unwrap_or(DEFAULT_METHOD);
        let broadcast_duration_secs: i64 = ctx
            .params
            .get("broadcastDurationSecs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let token = self.negotiate(host, hub).await?;
        let ws_url = format!(
            "ws://{host}/signalr/connect?transport=webSockets&clientProtocol=1.4&connectionToken={}&connectionData={}&tid=0",
            urlencode(&token),
            urlencode(&connection_data(hub)),
        );
        let (ws_stream, _) = connect_async(&ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Wait for the init ack before hitting /start, matching the
        // handshake order the framework transport requires.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) else {
                        continue;
                    };
                    if frame.init == Some(1) {
                        break;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(ScenarioError::Timeout("init ack")),
            }
        }

        self.start(host, hub, &token).await?;

        let (tx, mut rx) = mpsc::channel::<i64>(broadcast_duration_secs.max(1) as usize);
        let user_id = ctx.user_id.clone();
        let expect_method = method.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Ok(Message::Text(text)) = msg else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) else {
                    continue;
                };
                for inv in frame.messages {
                    if inv.method != expect_method {
                        continue;
                    }
                    if inv.arguments.first().map(String::as_str) != Some(user_id.as_str()) {
                        continue;
                    }
                    let Some(sent_at) = inv.arguments.get(1).and_then(|a| a.parse::<i64>().ok()) else {
                        continue;
                    };
                    let latency_ms = (now_nanos() - sent_at) / 1_000_000;
                    if tx.send(latency_ms).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.counters.incr("signalrfx:broadcast:sender:connected");

        for _ in 0..broadcast_duration_secs {
            let frame = ClientFrame {
                hub,
                method,
                arguments: vec![ctx.user_id.clone(), now_nanos().to_string()],
                invocation_id: "0",
            };
            let body = serde_json::to_string(&frame)?;
            write.send(Message::text(body)).await?;
            self.counters.incr("signalrfx:broadcast:sender:msgsendcount");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.counters.add("signalrfx:broadcast:sender:connected", -1);

        let mut received = 0i64;
        let deadline = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(deadline);
        let outcome = loop {
            if received >= broadcast_duration_secs {
                break Ok(());
            }
            tokio::select! {
                latency = rx.recv() => {
                    match latency {
                        Some(latency_ms) => {
                            self.counters.incr("signalrfx:broadcast:sender:messages:recv");
                            self.record_latency(latency_ms);
                            received += 1;
                        }
                        None => break Err(ScenarioError::Timeout("broadcast reader channel closed")),
                    }
                }
                _ = &mut deadline => {
                    self.counters.incr("signalrfx:broadcast:sender:errornotrecvall");
                    break Err(ScenarioError::Timeout("broadcast round trip"));
                }
            }
        };

        if outcome.is_err() {
            reader.abort();
            return outcome;
        }

        // Graceful close, mirroring `signalr_core_echo`'s handshake: send a
        // Close frame, then wait up to one minute for the reader task to
        // observe the server's close ack (its read loop ending). Unlike the
        // close-send itself, a timed-out ack does not fail the session — it
        // only counts as `closeerror`, matching the source's unconditional
        // return after this step.
        write.send(Message::Close(None)).await?;
        let close_deadline = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(close_deadline);
        tokio::select! {
            join_result = &mut reader => {
                if let Err(join_err) = join_result {
                    warn!(%join_err, "broadcast reader task panicked while awaiting close ack");
                }
            }
            _ = &mut close_deadline => {
                self.counters.incr("signalrfx:broadcast:sender:closeerror");
                reader.abort();
            }
        }

        Ok(())
    }
}

/// Minimal query-string percent-encoding sufficient for the JSON
/// `connectionData` payload and opaque connection tokens this scenario
/// sends as query parameters.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl Scenario for SignalRFrameworkBroadcastSender {
    fn name(&self) -> &str {
        TAG
    }

    async fn setup(&self, _params: &HashMap<String, String>) -> Result<(), ScenarioError> {
        Ok(())
    }

    async fn execute(&self, ctx: &UserContext) -> Result<(), ScenarioError> {
        self.counters.incr("signalrfx:broadcast:sender:inprogress");
        let result = self.run_session(ctx).await;
        self.counters.add("signalrfx:broadcast:sender:inprogress", -1);

        match result {
            Ok(()) => {
                self.counters.incr("signalrfx:broadcast:sender:success");
                Ok(())
            }
            Err(err) => {
                debug!(user = %ctx.user_id, %err, "signalr framework broadcast session failed");
                self.counters.incr("signalrfx:broadcast:sender:error");
                Err(err)
            }
        }
    }

    fn counters(&self) -> HashMap<String, i64> {
        self.counters.snapshot()
    }
}
