//! HTTP request handlers.

use super::AppState;
use crate::sentinel::SentinelError;
use crate::server::{mask_ip, HostState};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub async fn handle_healthz() -> impl IntoResponse {
    "ok"
}

// ============================================================================
// Services
// ============================================================================

/// Monitors shown on the public service page with their rolling statistics.
pub async fn handle_get_services(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sentinel.service_stats().await)
}

pub async fn handle_get_monitors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sentinel.monitors().await)
}

pub async fn handle_get_monitor(State(state): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    match state.sentinel.get_monitor(id).await {
        Ok(monitor) => Json(monitor).into_response(),
        Err(e @ SentinelError::UnknownMonitor(_)) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Alerts
// ============================================================================

pub async fn handle_get_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.alerts.alerts().await)
}

pub async fn handle_get_cycle_transfer(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.alerts.cycle_transfer_stats().await)
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ServerView {
    pub id: u64,
    pub name: String,
    pub ip: String,
    pub state: HostState,
    pub last_active: Option<DateTime<Utc>>,
}

pub async fn handle_get_servers(State(state): State<AppState>) -> Json<Vec<ServerView>> {
    let plain_ip = state.config.plain_ip;
    let servers: Vec<ServerView> = state
        .servers
        .snapshot()
        .await
        .into_iter()
        .map(|s| ServerView {
            ip: if plain_ip { s.host.ip } else { mask_ip(&s.host.ip) },
            id: s.id,
            name: s.name,
            state: s.state,
            last_active: s.last_active,
        })
        .collect();
    Json(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSentinel;
    use crate::config::ServerConfig;
    use crate::db::{Monitor, Store};
    use crate::mute::MuteStore;
    use crate::notify::testing::RecordingTasks;
    use crate::notify::{Dispatcher, NotificationCenter};
    use crate::scheduler::ProbeScheduler;
    use crate::sentinel::ServiceSentinel;
    use crate::server::{HostInfo, ServerRegistry};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    async fn app_state(store: Arc<Store>) -> AppState {
        let config = ServerConfig::default();
        let servers = Arc::new(ServerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(NotificationCenter::new()),
            Arc::new(RecordingTasks::default()),
            Arc::new(MuteStore::new()),
            4,
        ));
        let (schedule, _bus) = ProbeScheduler::new();
        let (sentinel, _rx) = ServiceSentinel::new(
            store.clone(),
            Arc::new(schedule),
            servers.clone(),
            dispatcher.clone(),
            &config,
        )
        .await
        .unwrap();
        let alerts = AlertSentinel::new(store, servers.clone(), dispatcher, &config).unwrap();

        AppState {
            config,
            sentinel: Arc::new(sentinel),
            alerts: Arc::new(alerts),
            servers,
        }
    }

    #[tokio::test]
    async fn test_get_monitor() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let mut m = Monitor {
            name: "api".to_string(),
            target: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut m).unwrap();
        let state = app_state(store).await;

        let resp = handle_get_monitor(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle_get_monitor(State(state), Path(id + 1)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_servers_masks_ip() {
        let file = NamedTempFile::new().unwrap();
        let state = app_state(Arc::new(Store::new(file.path()).unwrap())).await;
        let host = HostInfo {
            ip: "172.16.4.20".to_string(),
            ..Default::default()
        };
        state.servers.upsert(2, "db-2", host).await;

        let Json(servers) = handle_get_servers(State(state)).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].ip, "172.****.20");
    }
}
