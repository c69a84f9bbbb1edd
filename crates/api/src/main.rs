use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use rightsize_core::domain::recommendation::{
    Actor, ExecutionAttempt, Recommendation, SavingsSummary, Status,
};
use rightsize_core::error::EngineError;
use rightsize_core::storage::pg::PgStore;
use rightsize_core::storage::RecommendationStore;
use rightsize_core::workflow::{ApprovalPolicy, ApprovalWorkflow, Decision};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = rightsize_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let policy = ApprovalPolicy::from_env()?;

    let store: Option<Arc<dyn RecommendationStore>> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match rightsize_core::storage::migrate(&pool).await {
                Ok(()) => {
                    let store: Arc<dyn RecommendationStore> = Arc::new(PgStore::new(pool));
                    Some(store)
                }
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let app = router(AppState::new(store, policy));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/recommendations", get(list_recommendations))
        .route("/recommendations/:id", get(get_recommendation))
        .route("/recommendations/:id/attempts", get(get_attempts))
        .route("/recommendations/:id/decision", post(post_decision))
        .route("/savings/summary", get(get_savings_summary))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

/// `store` is `None` when the database was unreachable at startup; every data route
/// then answers 503.
#[derive(Clone)]
struct AppState {
    store: Option<Arc<dyn RecommendationStore>>,
    workflow: Option<ApprovalWorkflow>,
}

impl AppState {
    fn new(store: Option<Arc<dyn RecommendationStore>>, policy: ApprovalPolicy) -> Self {
        let workflow = store
            .clone()
            .map(|store| ApprovalWorkflow::new(store, policy));
        Self { store, workflow }
    }

    fn store(&self) -> Result<&dyn RecommendationStore, StatusCode> {
        self.store
            .as_deref()
            .ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn engine_status(err: EngineError) -> StatusCode {
    match err {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition { .. }
        | EngineError::ConcurrentModification { .. }
        | EngineError::AlreadyExecuting { .. } => StatusCode::CONFLICT,
        EngineError::PreconditionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Storage(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_recommendations(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Recommendation>>, StatusCode> {
    let store = state.store()?;

    let statuses = match q.status.as_deref() {
        Some(s) => vec![s.parse::<Status>().map_err(|_| StatusCode::BAD_REQUEST)?],
        None => Status::ALL.to_vec(),
    };

    let mut out = Vec::new();
    for status in statuses {
        out.extend(store.list_by_status(status).await.map_err(engine_status)?);
    }
    Ok(Json(out))
}

async fn get_recommendation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Recommendation>, StatusCode> {
    let rec = state.store()?.get(id).await.map_err(engine_status)?;
    Ok(Json(rec))
}

async fn get_attempts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ExecutionAttempt>>, StatusCode> {
    let store = state.store()?;
    store.get(id).await.map_err(engine_status)?;
    let attempts = store.list_attempts(id).await.map_err(engine_status)?;
    Ok(Json(attempts))
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    decision: Decision,
    actor: String,
}

async fn post_decision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<Recommendation>, StatusCode> {
    let Some(workflow) = &state.workflow else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let actor = Actor::approver(&body.actor).map_err(|_| StatusCode::BAD_REQUEST)?;
    let rec = workflow
        .decide(id, body.decision, actor)
        .await
        .map_err(engine_status)?;
    Ok(Json(rec))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    since: Option<String>,
    until: Option<String>,
    days: Option<i64>,
}

async fn get_savings_summary(
    State(state): State<AppState>,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<SavingsSummary>, StatusCode> {
    let store = state.store()?;

    let (start, end) = rightsize_core::time::window::resolve_window(
        q.since.as_deref(),
        q.until.as_deref(),
        q.days,
        chrono::Utc::now(),
    )
    .map_err(|_| StatusCode::BAD_REQUEST)?;

    let summary = store
        .realized_savings(start, end)
        .await
        .map_err(engine_status)?;
    Ok(Json(summary))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &rightsize_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rightsize_core::domain::recommendation::{Action, ResourceKind, ResourceRef};
    use rightsize_core::storage::memory::MemoryStore;

    async fn state_with(savings: f64) -> (AppState, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let rec = Recommendation::new_pending(
            ResourceRef::new(ResourceKind::Database, "db-1"),
            Action::Stop,
            savings,
            0.1,
            chrono::Utc::now(),
        );
        store.create(&rec).await.unwrap();

        let state = AppState::new(
            Some(store as Arc<dyn RecommendationStore>),
            ApprovalPolicy::default(),
        );
        state
            .workflow
            .as_ref()
            .unwrap()
            .submit(rec.id)
            .await
            .unwrap();
        (state, rec.id)
    }

    fn decision(decision: Decision, actor: &str) -> Json<DecisionRequest> {
        Json(DecisionRequest {
            decision,
            actor: actor.to_string(),
        })
    }

    #[tokio::test]
    async fn degraded_mode_answers_503() {
        let state = AppState::new(None, ApprovalPolicy::default());
        let err = get_recommendation(State(state.clone()), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);

        let err = post_decision(
            State(state),
            Path(Uuid::new_v4()),
            decision(Decision::Approve, "alice"),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn review_queue_lists_and_accepts_decisions() {
        let (state, id) = state_with(500.0).await;

        let Json(queue) = list_recommendations(
            State(state.clone()),
            Query(ListQuery {
                status: Some("AWAITING_REVIEW".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, id);

        let Json(rec) = post_decision(
            State(state.clone()),
            Path(id),
            decision(Decision::Approve, "alice"),
        )
        .await
        .unwrap();
        assert_eq!(rec.status, Status::Approved);

        // Redelivered decision.
        let err = post_decision(State(state.clone()), Path(id), decision(Decision::Reject, "bob"))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::CONFLICT);

        let Json(full) = get_recommendation(State(state), Path(id)).await.unwrap();
        let path: Vec<Status> = full.history.iter().map(|e| e.to).collect();
        assert_eq!(
            path,
            vec![Status::Pending, Status::AwaitingReview, Status::Approved]
        );
    }

    #[tokio::test]
    async fn bad_input_is_rejected() {
        let (state, id) = state_with(500.0).await;

        let err = list_recommendations(
            State(state.clone()),
            Query(ListQuery {
                status: Some("DONE".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);

        let err = post_decision(State(state.clone()), Path(id), decision(Decision::Approve, "  "))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);

        let err = get_attempts(State(state.clone()), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);

        let err = get_savings_summary(
            State(state),
            Query(SummaryQuery {
                since: Some("yesterday".to_string()),
                until: None,
                days: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn savings_summary_defaults_to_thirty_days() {
        let (state, _) = state_with(50.0).await;
        let Json(summary) = get_savings_summary(
            State(state),
            Query(SummaryQuery {
                since: None,
                until: None,
                days: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(summary.succeeded_count, 0);
        assert_eq!(
            summary.window_end - summary.window_start,
            chrono::Duration::days(30)
        );
    }
}
