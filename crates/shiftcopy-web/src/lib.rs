//! JSON API over the copy engine for the scheduling UI.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use shiftcopy_core::{calc_hours, Employee, PatternSource, WeekPattern};
use shiftcopy_storage::StoreError;
use shiftcopy_sync::{
    CopyConfig, CopyEngine, CopyError, CopyPreview, CopyRequest, PersistedApply, StoreBackend,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftcopy-web";

#[derive(Clone)]
pub struct AppState {
    engine: Arc<CopyEngine>,
    backend: Option<Arc<StoreBackend>>,
}

impl AppState {
    pub fn new(engine: CopyEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            backend: None,
        }
    }

    /// Ties the state to a backend so snapshot-file stores are saved after each apply.
    pub fn with_backend(mut self, backend: Arc<StoreBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

#[derive(Debug, Serialize)]
struct PatternResponse {
    pattern: WeekPattern,
    hours: f64,
}

#[derive(Debug, Serialize)]
struct HoursResponse {
    hours: f64,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<CopyError> for ApiError {
    fn from(err: CopyError) -> Self {
        let status = match &err {
            CopyError::DuplicateTarget(_) => StatusCode::BAD_REQUEST,
            CopyError::Store(StoreError::UnknownEmployee(_)) => StatusCode::NOT_FOUND,
            CopyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        CopyError::from(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/employees", get(employees_handler))
        .route("/patterns/opening-hours", get(opening_hours_pattern_handler))
        .route("/patterns/employees/{id}", get(employee_pattern_handler))
        .route("/patterns/hours", post(pattern_hours_handler))
        .route("/copy/preview", post(preview_handler))
        .route("/copy/apply", post(apply_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = CopyConfig::from_env();
    let backend = Arc::new(StoreBackend::from_config(&config).await?);
    let engine =
        CopyEngine::new(backend.shift_store()).with_apply_concurrency(config.apply_concurrency);
    let state = AppState::new(engine).with_backend(backend);

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "shift copy API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn employees_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Employee>>, ApiError> {
    Ok(Json(state.engine.store().employees().await?))
}

async fn opening_hours_pattern_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PatternResponse>, ApiError> {
    pattern_response(&state, PatternSource::OpeningHours).await
}

async fn employee_pattern_handler(
    State(state): State<Arc<AppState>>,
    Path(employee_id): Path<Uuid>,
) -> Result<Json<PatternResponse>, ApiError> {
    pattern_response(&state, PatternSource::Employee { employee_id }).await
}

async fn pattern_response(
    state: &AppState,
    source: PatternSource,
) -> Result<Json<PatternResponse>, ApiError> {
    let pattern = state.engine.resolve_pattern(&source).await?;
    let hours = calc_hours(&pattern);
    Ok(Json(PatternResponse { pattern, hours }))
}

async fn pattern_hours_handler(Json(pattern): Json<WeekPattern>) -> Json<HoursResponse> {
    Json(HoursResponse {
        hours: calc_hours(&pattern),
    })
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CopyRequest>,
) -> Result<Json<CopyPreview>, ApiError> {
    Ok(Json(state.engine.preview(&request).await?))
}

async fn apply_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CopyRequest>,
) -> Result<Response, ApiError> {
    let result = state.engine.apply(&request).await?;
    let applied = match &state.backend {
        Some(backend) => backend.persist_applied(result).await,
        None => PersistedApply::from(result),
    };
    let status = if applied.persist_error.is_some() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(applied)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Weekday;
    use http_body_util::BodyExt;
    use shiftcopy_core::{ExistingShift, Interval, OpeningHours};
    use shiftcopy_storage::{MemoryShiftStore, ShiftStore};
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        store: Arc<MemoryShiftStore>,
        stylist: Uuid,
        trainee: Uuid,
    }

    fn fixture() -> Fixture {
        let stylist = Uuid::new_v4();
        let trainee = Uuid::new_v4();
        let interval = Interval::parse("09:00", "17:00").expect("interval");
        let mut hours = OpeningHours::default();
        hours.set(Weekday::Mon, Some(interval));
        hours.set(Weekday::Sat, Some(Interval::parse("10:00", "14:00").expect("interval")));
        let store = Arc::new(MemoryShiftStore::new(
            Uuid::new_v4(),
            vec![
                Employee {
                    id: stylist,
                    display_name: "Stylist".into(),
                },
                Employee {
                    id: trainee,
                    display_name: "Trainee".into(),
                },
            ],
            vec![ExistingShift {
                employee_id: stylist,
                weekday: Weekday::Tue,
                interval,
            }],
            hours,
        ));
        let router = app(AppState::new(CopyEngine::new(store.clone())));
        Fixture {
            router,
            store,
            stylist,
            trainee,
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn lists_employees() {
        let fx = fixture();
        let (status, body) = send(fx.router, get("/employees")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn opening_hours_pattern_reports_hours() {
        let fx = fixture();
        let (status, body) = send(fx.router, get("/patterns/opening-hours")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hours"], 12.0);
        assert_eq!(body["pattern"]["days"][0]["enabled"], true);
        assert_eq!(body["pattern"]["days"][1]["enabled"], false);
    }

    #[tokio::test]
    async fn unknown_employee_pattern_is_not_found() {
        let fx = fixture();
        let uri = format!("/patterns/employees/{}", Uuid::new_v4());
        let (status, body) = send(fx.router, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("does not belong"));
    }

    #[tokio::test]
    async fn preview_then_apply_copies_employee_pattern() {
        let fx = fixture();
        let uri = format!("/patterns/employees/{}", fx.stylist);
        let (_, pattern) = send(fx.router.clone(), get(&uri)).await;
        let request = serde_json::json!({
            "pattern": pattern["pattern"],
            "targets": [fx.trainee],
            "strategy": "additive",
        });

        let (status, preview) = send(fx.router.clone(), post_json("/copy/preview", request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["summary"]["total_create"], 1);
        assert_eq!(preview["analyses"][0]["details"][0]["action"], "create");

        let (status, result) = send(fx.router, post_json("/copy/apply", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["created"], 1);
        assert!(result["errors"].as_array().unwrap().is_empty());
        assert!(result.get("persist_error").is_none());
        let trainee = fx.store.shifts_for_employee(fx.trainee).await.unwrap();
        assert_eq!(trainee.len(), 1);
    }

    #[tokio::test]
    async fn apply_reports_outcomes_when_snapshot_save_fails() {
        let fx = fixture();
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").expect("write blocker");
        let backend = Arc::new(StoreBackend::Snapshot {
            store: fx.store.clone(),
            path: blocker.join("salon.yaml"),
        });
        let router =
            app(AppState::new(CopyEngine::new(backend.shift_store())).with_backend(backend));
        let mut pattern = WeekPattern::empty();
        pattern.add_interval(Weekday::Wed, Interval::parse("09:00", "13:00").unwrap());
        let request = serde_json::json!({
            "pattern": pattern,
            "targets": [fx.trainee],
        });

        let (status, body) = send(router, post_json("/copy/apply", request)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["created"], 1);
        assert_eq!(body["per_target"][0]["employee_id"], fx.trainee.to_string());
        assert!(body["persist_error"].as_str().unwrap().contains("saving salon snapshot"));
        assert_eq!(fx.store.shifts_for_employee(fx.trainee).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_targets_are_a_bad_request() {
        let fx = fixture();
        let request = serde_json::json!({
            "pattern": WeekPattern::empty(),
            "targets": [fx.trainee, fx.trainee],
        });
        let (status, body) = send(fx.router, post_json("/copy/apply", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("more than once"));
    }

    #[tokio::test]
    async fn pattern_hours_endpoint_sums_enabled_days() {
        let fx = fixture();
        let mut pattern = WeekPattern::empty();
        pattern.add_interval(Weekday::Mon, Interval::parse("09:00", "12:00").unwrap());
        pattern.add_interval(Weekday::Mon, Interval::parse("13:00", "17:00").unwrap());
        let body = serde_json::to_value(&pattern).unwrap();
        let (status, body) = send(fx.router, post_json("/patterns/hours", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hours"], 7.0);
    }
}
