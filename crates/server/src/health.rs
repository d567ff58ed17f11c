use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use itinera_core::engine::ApprovalEngine;
use itinera_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    engine: Arc<ApprovalEngine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub timers: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, engine: Arc<ApprovalEngine>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, engine })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    engine: Arc<ApprovalEngine>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, engine)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "itinera-server runtime initialized".to_string(),
        },
        database,
        timers: timer_check(&state.engine).await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn timer_check(engine: &ApprovalEngine) -> HealthCheck {
    let pending = engine.pending_timers().await;
    let detail = match engine.next_deadline().await {
        Some(deadline) => {
            format!("{pending} step deadline(s) scheduled; next at {}", deadline.to_rfc3339())
        }
        None => format!("{pending} step deadline(s) scheduled"),
    };
    HealthCheck { status: "ready", detail }
}
