//! Rotas HTTP do servidor de ingestão.
//!
//! - `POST /data` – lote autenticado do coletor
//! - `GET /mac_lookup?macaddr=` – nome do sensor para um MAC (401 se desconhecido)
//! - `GET /recent_lookups` – últimas consultas de MAC, uma por linha
//! - `GET /latest/:sensorname` – projeção "último valor" em JSON

use crate::AppState;
use crate::store::{LatestRow, TimeSeriesStore};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Teto do corpo de `/data`. Cerca de 3 milhões de registros de três campos,
/// ou semanas de leituras a 1 Hz acumuladas no coletor. Um lote acima disso
/// recebe 413 a cada tentativa até o coletor ser reiniciado.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/data", post(data))
        .route("/mac_lookup", get(mac_lookup))
        .route("/recent_lookups", get(recent_lookups))
        .route("/latest/:sensorname", get(latest))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /data
async fn data(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> StatusCode {
    let peer = peer.map_or_else(|| "?".to_string(), |ConnectInfo(addr)| addr.to_string());
    // SQLite e o comando de notificação bloqueiam
    let result =
        tokio::task::spawn_blocking(move || state.ingest.handle_data(&body, &peer)).await;
    result.unwrap_or_else(|e| {
        error!("Tarefa de ingestão abortada: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Deserialize)]
struct MacQuery {
    macaddr: String,
}

/// GET /mac_lookup?macaddr=...
async fn mac_lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MacQuery>,
) -> (StatusCode, String) {
    let lookup_state = Arc::clone(&state);
    let mac = query.macaddr.clone();
    let result =
        tokio::task::spawn_blocking(move || lookup_state.store.lookup_mac(&mac)).await;

    let (status, name) = match result {
        Ok(Ok(Some(name))) => (StatusCode::OK, Some(name)),
        Ok(Ok(None)) => (StatusCode::UNAUTHORIZED, None),
        Ok(Err(e)) => {
            error!("Consulta de MAC falhou: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
        }
        Err(e) => {
            error!("Tarefa de consulta abortada: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
        }
    };

    let msg = format!(
        "Consulta do MAC {}, resultado {}",
        query.macaddr,
        name.as_deref().unwrap_or("nenhum")
    );
    info!("{msg}");
    state.record_lookup(msg);
    (status, name.unwrap_or_default())
}

/// GET /recent_lookups
async fn recent_lookups(State(state): State<Arc<AppState>>) -> String {
    state.recent_lookups().join("\n")
}

/// GET /latest/:sensorname
async fn latest(
    State(state): State<Arc<AppState>>,
    Path(sensorname): Path<String>,
) -> Result<Json<Vec<LatestRow>>, StatusCode> {
    let sensor = state
        .ingest
        .normalizer()
        .registry()
        .sensor_by_name(&sensorname)
        .ok_or(StatusCode::NOT_FOUND)?;

    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.latest(sensor.id)).await {
        Ok(Ok(rows)) => Ok(Json(rows)),
        Ok(Err(e)) => {
            error!("Leitura de latest falhou para {sensorname}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            error!("Tarefa de leitura abortada: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
