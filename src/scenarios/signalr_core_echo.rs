//! SignalR Core echo scenarios: a lightweight round-trip latency probe over
//! a single WebSocket, in both plain (app-server) and Azure SignalR Service
//! "service-connect" flavours. Both share the same wire handling and only
//! differ in how the WebSocket URL is obtained.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::connection_pool::{PoolConfig, GLOBAL_POOL_STATS};
use crate::counters::{CounterBag, LatencyHistogram};
use crate::errors::ScenarioError;
use crate::job::UserContext;
use crate::scenario::Scenario;
use std::collections::HashMap;

use super::jwt::sign_service_token;
use super::wire::{protocol_handshake_frame, tokenize_text_frames, CommonMessage, HandshakeResponse, Invocation};

lazy_static! {
    static ref NEGOTIATE_CLIENT: reqwest::Client = PoolConfig::default()
        .apply_to_builder(reqwest::Client::builder())
        .build()
        .expect("negotiate http client builds");
}

fn now_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

/// `signalrcore:echo` (direct) and `signalrcoreservice:echo` (Azure SignalR
/// Service) both run through this struct; `service_mode` selects the connect
/// strategy.
pub struct SignalRCoreEcho {
    tag: &'static str,
    service_mode: bool,
    counters: CounterBag,
    latency: LatencyHistogram,
}

impl SignalRCoreEcho {
    pub fn direct() -> Self {
        Self {
            tag: "signalrcore:echo",
            service_mode: false,
            counters: CounterBag::new(),
            latency: LatencyHistogram::new("signalrcore:echo", 11, 100),
        }
    }

    pub fn service_connect() -> Self {
        Self {
            tag: "signalrcoreservice:echo",
            service_mode: true,
            counters: CounterBag::new(),
            latency: LatencyHistogram::new("signalrcoreservice:echo", 11, 100),
        }
    }

    async fn connect_url(&self, params: &HashMap<String, String>) -> Result<String, ScenarioError> {
        let hub = params.get("hub").map(String::as_str).unwrap_or("chat");

        if self.service_mode {
            let app_host = params
                .get("appHost")
                .ok_or_else(|| ScenarioError::Setup("missing appHost param for service-connect scenario".into()))?;
            let key = params
                .get("key")
                .ok_or_else(|| ScenarioError::Setup("missing key param for service-connect scenario".into()))?;
            let audience = params
                .get("audience")
                .cloned()
                .unwrap_or_else(|| format!("https://{app_host}/client/?hub={hub}"));
            let token = sign_service_token(key, &audience)?;
            return Ok(format!("wss://{app_host}/client/?hub={hub}&access_token={token}"));
        }

        let host = params
            .get("host")
            .ok_or_else(|| ScenarioError::Setup("missing host param".into()))?;
        let use_nego = params.get("useNego").map(String::as_str) == Some("true");

        if use_nego {
            let negotiate_url = format!("http://{host}/{hub}/negotiate");
            let negotiate_start = std::time::Instant::now();
            let resp: HandshakeResponse = NEGOTIATE_CLIENT.post(&negotiate_url).send().await?.json().await?;
            GLOBAL_POOL_STATS.record_request(negotiate_start.elapsed().as_millis() as u64);
            Ok(format!("ws://{host}/{hub}?id={}", resp.connection_id))
        } else {
            Ok(format!("ws://{host}/{hub}"))
        }
    }

    fn record_if_echo(&self, inv: &Invocation, user_id: &str) {
        if inv.target != "echo" || inv.arguments.len() < 2 || inv.arguments[0] != user_id {
            return;
        }
        if let Ok(sent_at) = inv.arguments[1].parse::<i64>() {
            let latency_ms = (now_nanos() - sent_at) / 1_000_000;
            self.latency.record(latency_ms);
        }
    }

    /// Processes one inbound WebSocket message (possibly several concatenated
    /// frames). Returns true if a `start` invocation was among them.
    fn process_message(&self, msg: &Message, user_id: &str) -> bool {
        let mut saw_start = false;
        match msg {
            Message::Text(text) => {
                for frame in tokenize_text_frames(text.as_bytes()) {
                    let Ok(common) = serde_json::from_slice::<CommonMessage>(frame) else {
                        continue;
                    };
                    if common.message_type != 1 {
                        continue;
                    }
                    let Ok(inv) = serde_json::from_slice::<Invocation>(frame) else {
                        continue;
                    };
                    saw_start |= inv.target == "start";
                    self.record_if_echo(&inv, user_id);
                }
            }
            Message::Binary(bytes) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    let Some((body, consumed)) = super::wire::decode_length_prefixed(&bytes[offset..]) else {
                        break;
                    };
                    if let Ok(inv) = Invocation::from_msgpack(body) {
                        if inv.message_type == 1 {
                            saw_start |= inv.target == "start";
                            self.record_if_echo(&inv, user_id);
                        }
                    }
                    offset += consumed;
                }
            }
            _ => {}
        }
        saw_start
    }

    async fn send_echo<S>(&self, write: &mut S, user_id: &str, use_msgpack: bool) -> Result<(), ScenarioError>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let inv = Invocation::echo(user_id, now_nanos());
        let message = if use_msgpack {
            Message::binary(inv.to_msgpack_frame().map_err(|err| ScenarioError::Protocol(err.to_string()))?)
        } else {
            Message::text(String::from_utf8(inv.to_json_frame()?).expect("json frame is valid utf8"))
        };
        write.send(message).await?;
        Ok(())
    }

    async fn run_session(&self, ctx: &UserContext, key_msgsend: &str) -> Result<(), ScenarioError> {
        let use_msgpack = ctx.params.get("protocol").map(String::as_str) == Some("messagepack");
        let lazy_sending = ctx.params.get("lazySending").map(String::as_str) == Some("true");
        let repeat_echo = ctx.params.get("repeatEcho").map(String::as_str) == Some("true");

        let url = self.connect_url(&ctx.params).await?;
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::text(String::from_utf8(protocol_handshake_frame(use_msgpack)).unwrap()))
            .await?;

        if lazy_sending {
            loop {
                match read.next().await {
                    Some(Ok(msg)) => {
                        if self.process_message(&msg, &ctx.user_id) {
                            break;
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(ScenarioError::Timeout("start invocation")),
                }
            }
        }

        self.send_echo(&mut write, &ctx.user_id, use_msgpack).await?;
        self.counters.incr(key_msgsend);

        if repeat_echo {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.send_echo(&mut write, &ctx.user_id, use_msgpack).await?;
                        self.counters.incr(key_msgsend);
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(m)) => { self.process_message(&m, &ctx.user_id); }
                            Some(Err(err)) => return Err(err.into()),
                            None => return Ok(()),
                        }
                    }
                }
            }
        }

        write.send(Message::Close(None)).await?;
        let deadline = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(m)) => { self.process_message(&m, &ctx.user_id); }
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
                _ = &mut deadline => {
                    return Err(ScenarioError::Timeout("close acknowledgement"));
                }
            }
        }
    }
}

#[async_trait]
impl Scenario for SignalRCoreEcho {
    fn name(&self) -> &str {
        self.tag
    }

    async fn setup(&self, _params: &HashMap<String, String>) -> Result<(), ScenarioError> {
        Ok(())
    }

    async fn execute(&self, ctx: &UserContext) -> Result<(), ScenarioError> {
        let key_inprogress = format!("{}:inprogress", self.tag);
        let key_success = format!("{}:success", self.tag);
        let key_error = format!("{}:error", self.tag);
        let key_msgsend = format!("{}:msgsendcount", self.tag);

        self.counters.incr(&key_inprogress);
        let result = self.run_session(ctx, &key_msgsend).await;
        self.counters.add(&key_inprogress, -1);

        match result {
            Ok(()) => {
                self.counters.incr(&key_success);
                Ok(())
            }
            Err(err) => {
                debug!(scenario = self.tag, user = %ctx.user_id, %err, "echo session failed");
                self.counters.incr(&key_error);
                Err(err)
            }
        }
    }

    fn counters(&self) -> HashMap<String, i64> {
        let mut out = self.counters.snapshot();
        self.latency.export_into(&mut out);
        out
    }
}
