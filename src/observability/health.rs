//! Health check HTTP server
//!
//! Exposes node status for operators and orchestrators: overall health, probes,
//! the metrics snapshot and the most recent operator events.

use crate::events::{Event, EventLog};
use crate::observability::metrics::{current_timestamp, metrics};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// Seconds without any poll before sampling is reported as stale
const SAMPLING_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// Events returned by `/events` when no limit is given
const DEFAULT_EVENTS_LIMIT: usize = 100;

/// HTTP health check server
pub struct HealthServer {
    node_id: String,
    port: u16,
    mqtt_connected: AtomicBool,
    events: Arc<EventLog>,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new(node_id: String, port: u16, events: Arc<EventLog>) -> Self {
        Self {
            node_id,
            port,
            mqtt_connected: AtomicBool::new(false),
            events,
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    /// Update MQTT connection status
    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Add or replace a named health check
    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// All routes served by the health server
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);
        let events_server = Arc::clone(&self);

        // GET /health - overall status with individual checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.get_health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - metrics snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - readiness probe, requires the broker connection
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.mqtt_connected.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /events?limit=N - most recent operator events, newest first
        let events_route = warp::path("events")
            .and(warp::path::end())
            .and(warp::get())
            .and(warp::query::<EventsQuery>())
            .map(move |query: EventsQuery| {
                let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
                let events: Vec<Event> = events_server.events.recent(limit);
                warp::reply::json(&events)
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = HashMap::from([
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Scheduling, delivery and per-adapter metrics"),
                ("/ready", "Readiness probe, requires the MQTT connection"),
                ("/live", "Liveness probe"),
                ("/events", "Most recent operator events"),
            ]);
            warp::reply::json(&endpoints)
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(events_route)
            .or(root_route)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!(port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();

        checks.insert("mqtt".to_string(), self.check_mqtt_health(now));
        checks.insert("sampling".to_string(), check_sampling_health(now, latest_poll()));

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status != "unhealthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            node_id: self.node_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self, now: u64) -> HealthCheck {
        if self.mqtt_connected.load(Ordering::Relaxed) {
            HealthCheck::new("healthy", "MQTT connection established", now)
        } else {
            HealthCheck::new("unhealthy", "MQTT connection failed or disconnected", now)
        }
    }
}

fn latest_poll() -> u64 {
    metrics()
        .get_metrics()
        .adapters
        .values()
        .map(|adapter| adapter.last_poll)
        .max()
        .unwrap_or(0)
}

/// Staleness of the most recent poll (pure function)
fn check_sampling_health(now: u64, last_poll: u64) -> HealthCheck {
    if last_poll == 0 {
        HealthCheck::new("healthy", "No polls executed yet", now)
    } else if now.saturating_sub(last_poll) > SAMPLING_STALENESS_THRESHOLD_SECONDS {
        let stale_duration = now - last_poll;
        HealthCheck::new(
            "stale",
            format!("No polling activity for {stale_duration} seconds"),
            now,
        )
    } else {
        HealthCheck::new("healthy", "Recent polling activity", now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>, message: impl Into<String>, last_check: u64) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    node_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventService, EventSeverity};

    fn server() -> Arc<HealthServer> {
        Arc::new(HealthServer::new(
            "test-node".to_string(),
            8080,
            Arc::new(EventLog::new()),
        ))
    }

    #[tokio::test]
    async fn test_ready_follows_mqtt_status() {
        let server = server();
        let routes = Arc::clone(&server).routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        server.set_mqtt_connected(true);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let routes = server().routes();
        let response = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_events_endpoint_returns_recent_events() {
        let server = server();
        server.events.fire(
            Event::adapter("plc-1", "modbus")
                .with_severity(EventSeverity::Warn)
                .with_message("first")
                .build(),
        );
        server.events.fire(Event::adapter("plc-1", "modbus").with_message("second").build());
        let routes = Arc::clone(&server).routes();

        let response = warp::test::request()
            .path("/events?limit=1")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"], "second");
    }

    #[tokio::test]
    async fn test_health_degraded_without_mqtt() {
        let server = server();

        let status = server.get_health_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.node_id, "test-node");
        assert!(status.checks.contains_key("mqtt"));
        assert!(status.checks.contains_key("sampling"));

        server.set_mqtt_connected(true);
        let status = server.get_health_status().await;
        assert_eq!(status.status, "healthy");
    }

    #[tokio::test]
    async fn test_additional_checks_affect_status() {
        let server = server();
        server.set_mqtt_connected(true);

        server
            .add_health_check(
                "queue".to_string(),
                HealthCheck::new("unhealthy", "queue unavailable", current_timestamp()),
            )
            .await;
        assert_eq!(server.get_health_status().await.status, "degraded");

        server.remove_health_check("queue").await;
        assert_eq!(server.get_health_status().await.status, "healthy");
    }

    #[test]
    fn test_sampling_staleness() {
        let now = 10_000;
        assert_eq!(check_sampling_health(now, 0).status, "healthy");
        assert_eq!(check_sampling_health(now, now - 10).status, "healthy");
        assert_eq!(check_sampling_health(now, now - 600).status, "stale");
    }
}
