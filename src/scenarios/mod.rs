//! The reference protocol plug-ins: SignalR Core echo (direct and Azure
//! SignalR Service "service-connect"), classic SignalR Framework broadcast,
//! and Redis Pub/Sub round-trip latency. Each module owns its wire format
//! and its own `CounterBag`/`LatencyHistogram` state; registration into a
//! process-wide [`crate::scenario::ScenarioRegistry`] happens in
//! [`build_registry`].

pub mod jwt;
pub mod redis_pubsub;
pub mod signalr_core_echo;
pub mod signalr_framework_broadcast;
pub mod wire;

use std::sync::Arc;

use crate::scenario::ScenarioRegistry;

/// Builds the process-wide scenario registry. Every scenario a Job might
/// reference by name must be registered here before the worker accepts
/// `Setup`/`Run` calls; an unregistered name is a fatal
/// [`crate::errors::ScenarioNotFoundError`] at `Run` time.
pub fn build_registry() -> ScenarioRegistry {
    let mut registry = ScenarioRegistry::new();
    registry.register(Arc::new(signalr_core_echo::SignalRCoreEcho::direct()));
    registry.register(Arc::new(signalr_core_echo::SignalRCoreEcho::service_connect()));
    registry.register(Arc::new(
        signalr_framework_broadcast::SignalRFrameworkBroadcastSender::new(),
    ));
    registry.register(Arc::new(redis_pubsub::RedisPubSub::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_carries_every_reference_scenario() {
        let registry = build_registry();
        let mut names: Vec<&str> = registry.names().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "redis:pubsub",
                "signalrcore:echo",
                "signalrcoreservice:echo",
                "signalrfx:broadcast:sender",
            ]
        );
    }
}
