use crate::{
    aggregates::{SiteAggregate, SiteAggregateStore},
    error::TrackerError,
    intervals::{IntervalStore, TimeInterval},
    limits::{LimitNotification, LimitStore, RecentNotifications, SiteLimit},
    settings::{Settings, SettingsPatch, SettingsStore},
    tracker::{Clock, Signal, SignalSender, TargetId, site},
    transfer::{ClearReport, ExportDocument, ImportDocument, ImportReport, Transfer},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// Everything the HTTP adapter hands to collaborators.
#[derive(Clone)]
pub struct ApiState {
    pub signals: SignalSender,
    pub clock: Arc<dyn Clock>,
    pub intervals: IntervalStore,
    pub aggregates: SiteAggregateStore,
    pub limits: LimitStore,
    pub settings: SettingsStore,
    pub transfer: Transfer,
    pub notifications: RecentNotifications,
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub async fn spawn(listen_addr: &str, state: ApiState) -> Result<ServerHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| "failed to parse listen_addr")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind api listener")?;

    let router = router(Arc::new(state));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "api listener started");

    Ok(ServerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/signals/activation", post(activation))
        .route("/signals/focus-lost", post(focus_lost))
        .route("/signals/removal", post(removal))
        .route("/intervals", get(list_intervals))
        .route("/intervals/:id", delete(delete_interval))
        .route("/aggregates", get(list_aggregates))
        .route("/aggregates/:site", get(get_aggregate).delete(delete_aggregate))
        .route("/aggregates/:site/recalculate", post(recalculate_aggregate))
        .route("/sites/:site", delete(remove_site))
        .route("/limits", get(list_limits))
        .route("/limits/:site", put(set_limit).delete(delete_limit))
        .route("/limits/:site/unblock", post(unblock_limit))
        .route("/settings", get(get_settings).patch(patch_settings))
        .route("/notifications", get(recent_notifications))
        .route("/export", get(export))
        .route("/import", post(import))
        .route("/data", delete(clear_all))
        .with_state(state)
}

enum ApiError {
    Tracker(TrackerError),
    TrackerStopped,
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        Self::Tracker(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Tracker(err @ TrackerError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            Self::Tracker(err @ TrackerError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            Self::Tracker(err @ TrackerError::Persistence { .. }) => {
                tracing::error!(error = %err, "request failed in storage");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            Self::TrackerStopped => (
                StatusCode::SERVICE_UNAVAILABLE,
                "session tracker is not running".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Path segments and query values may be full URLs; stored keys are hosts.
fn normalize(site_or_url: &str) -> String {
    site::site_key(site_or_url).unwrap_or_else(|| site_or_url.to_string())
}

fn timestamp_or_now(state: &ApiState, millis: Option<i64>) -> DateTime<Utc> {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| state.clock.now())
}

async fn enqueue(state: &ApiState, signal: Signal) -> ApiResult<StatusCode> {
    state
        .signals
        .send(signal)
        .await
        .map_err(|_| ApiError::TrackerStopped)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivationBody {
    url: String,
    #[serde(default)]
    target_id: Option<TargetId>,
    #[serde(default)]
    timestamp: Option<i64>,
}

async fn activation(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ActivationBody>,
) -> ApiResult<StatusCode> {
    let at = timestamp_or_now(&state, body.timestamp);
    enqueue(
        &state,
        Signal::Activated {
            site: body.url,
            target: body.target_id,
            at,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct FocusLostBody {
    #[serde(default)]
    timestamp: Option<i64>,
}

async fn focus_lost(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<FocusLostBody>,
) -> ApiResult<StatusCode> {
    let at = timestamp_or_now(&state, body.timestamp);
    enqueue(&state, Signal::FocusLost { at }).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovalBody {
    target_id: TargetId,
    #[serde(default)]
    timestamp: Option<i64>,
}

async fn removal(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RemovalBody>,
) -> ApiResult<StatusCode> {
    let at = timestamp_or_now(&state, body.timestamp);
    enqueue(
        &state,
        Signal::TargetRemoved {
            target: body.target_id,
            at,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct IntervalQuery {
    date: Option<NaiveDate>,
    site: Option<String>,
}

async fn list_intervals(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<IntervalQuery>,
) -> ApiResult<Json<Vec<TimeInterval>>> {
    let site_key = query.site.as_deref().map(normalize);
    let intervals = match (query.date, site_key) {
        (Some(date), Some(site_key)) => state
            .intervals
            .list_by_date(date)
            .await?
            .into_iter()
            .filter(|interval| interval.site_key == site_key)
            .collect(),
        (Some(date), None) => state.intervals.list_by_date(date).await?,
        (None, Some(site_key)) => state.intervals.list_by_site(&site_key).await?,
        (None, None) => state.intervals.list_all().await?,
    };
    Ok(Json(intervals))
}

async fn delete_interval(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.intervals.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrackerError::not_found("interval", id).into())
    }
}

async fn list_aggregates(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<SiteAggregate>>> {
    Ok(Json(state.aggregates.list_all().await?))
}

async fn get_aggregate(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<Json<SiteAggregate>> {
    Ok(Json(state.aggregates.require_by_site(&normalize(&site)).await?))
}

async fn recalculate_aggregate(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<Json<Option<SiteAggregate>>> {
    Ok(Json(state.aggregates.recalculate(&normalize(&site)).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SiteRemoval {
    site_key: String,
    aggregate_removed: bool,
    intervals_removed: u64,
}

async fn remove_site(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<Json<SiteRemoval>> {
    let site_key = normalize(&site);
    let purge = state.aggregates.remove_site(&site_key).await?;
    tracing::info!(site = %site_key, intervals = purge.intervals_removed, "site removed");
    Ok(Json(SiteRemoval {
        site_key,
        aggregate_removed: purge.aggregate_removed,
        intervals_removed: purge.intervals_removed,
    }))
}

/// Drops only the rollup; the ledger stays and can rebuild it.
async fn delete_aggregate(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<StatusCode> {
    let site_key = normalize(&site);
    if state.aggregates.delete(&site_key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrackerError::not_found("site aggregate", site_key).into())
    }
}

async fn list_limits(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<SiteLimit>>> {
    Ok(Json(state.limits.list_all().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimitBody {
    daily_limit_minutes: u32,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

async fn set_limit(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
    Json(body): Json<LimitBody>,
) -> ApiResult<Json<SiteLimit>> {
    Ok(Json(
        state
            .limits
            .set_limit(&site, body.daily_limit_minutes, body.enabled)
            .await?,
    ))
}

async fn delete_limit(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<StatusCode> {
    let site_key = normalize(&site);
    if state.limits.delete(&site_key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrackerError::not_found("site limit", site_key).into())
    }
}

async fn unblock_limit(
    State(state): State<Arc<ApiState>>,
    Path(site): Path<String>,
) -> ApiResult<Json<SiteLimit>> {
    Ok(Json(state.limits.unblock(&normalize(&site)).await?))
}

async fn get_settings(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Settings>> {
    Ok(Json(state.settings.load().await?))
}

async fn patch_settings(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Settings>> {
    Ok(Json(state.settings.update(patch).await?))
}

async fn recent_notifications(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<LimitNotification>> {
    Json(state.notifications.snapshot(None))
}

async fn export(State(state): State<Arc<ApiState>>) -> ApiResult<Json<ExportDocument>> {
    Ok(Json(state.transfer.export().await?))
}

async fn import(
    State(state): State<Arc<ApiState>>,
    Json(document): Json<ImportDocument>,
) -> ApiResult<Json<ImportReport>> {
    Ok(Json(state.transfer.import(document).await?))
}

async fn clear_all(State(state): State<Arc<ApiState>>) -> ApiResult<Json<ClearReport>> {
    Ok(Json(state.transfer.clear_all().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limits::{LimitMonitor, Notifier, spawn_notification_sink},
        storage::temp_storage,
        tracker::{self, SessionTracker, SystemClock, TrackerHandle, site::IgnoreList},
    };
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    const T0_MS: i64 = 1_740_830_400_000;

    struct Harness {
        _db: NamedTempFile,
        router: Router,
        tracker: TrackerHandle,
    }

    async fn harness() -> Harness {
        let (db, storage) = temp_storage().await;
        let intervals = IntervalStore::new(storage.clone());
        let aggregates = SiteAggregateStore::new(storage.clone(), intervals.clone());
        let limits = LimitStore::new(storage.clone());
        let settings = SettingsStore::new(storage);
        let (sink, notifier): (_, Notifier) = spawn_notification_sink(8, 8);
        let monitor = LimitMonitor::new(
            limits.clone(),
            aggregates.clone(),
            settings.clone(),
            notifier,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (tracker, signals) = tracker::spawn(
            SessionTracker::new(
                aggregates.clone(),
                monitor,
                IgnoreList::default(),
                ChronoDuration::seconds(60),
            ),
            clock.clone(),
            Duration::from_secs(3600),
            16,
        );
        let state = ApiState {
            signals,
            clock,
            transfer: Transfer::new(
                intervals.clone(),
                aggregates.clone(),
                limits.clone(),
                settings.clone(),
            ),
            intervals,
            aggregates,
            limits,
            settings,
            notifications: sink.recent(),
        };
        Harness {
            _db: db,
            router: router(Arc::new(state)),
            tracker,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn signals_flow_into_intervals_and_aggregates() {
        let Harness {
            _db,
            router,
            tracker,
        } = harness().await;

        let (status, _) = call(
            &router,
            "POST",
            "/signals/activation",
            Some(json!({"url": "https://a.com/feed", "targetId": 4, "timestamp": T0_MS})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(
            &router,
            "POST",
            "/signals/removal",
            Some(json!({"targetId": 4, "timestamp": T0_MS + 125_000})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        tracker.shutdown().await.unwrap();

        let (status, aggregate) = call(&router, "GET", "/aggregates/a.com", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(aggregate["totalSeconds"], 125);
        assert_eq!(aggregate["totalSessions"], 1);

        let (_, intervals) = call(&router, "GET", "/intervals?site=a.com", None).await;
        assert_eq!(intervals.as_array().unwrap().len(), 1);
        assert_eq!(intervals[0]["durationSeconds"], 125);

        let (status, _) = call(
            &router,
            "POST",
            "/signals/focus-lost",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn missing_aggregate_is_not_found() {
        let harness = harness().await;
        let (status, body) = call(&harness.router, "GET", "/aggregates/nope.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope.com"));
        harness.tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn limit_crud_and_validation() {
        let harness = harness().await;
        let router = &harness.router;

        let (status, limit) = call(
            router,
            "PUT",
            "/limits/b.com",
            Some(json!({"dailyLimitMinutes": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(limit["siteKey"], "b.com");
        assert_eq!(limit["enabled"], true);
        assert_eq!(limit["blocked"], false);

        let (status, _) = call(
            router,
            "PUT",
            "/limits/b.com",
            Some(json!({"dailyLimitMinutes": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, limits) = call(router, "GET", "/limits", None).await;
        assert_eq!(limits.as_array().unwrap().len(), 1);

        let (status, _) = call(router, "POST", "/limits/b.com/unblock", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router, "DELETE", "/limits/b.com", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(router, "DELETE", "/limits/b.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        harness.tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn settings_patch_and_transfer_round_trip() {
        let harness = harness().await;
        let router = &harness.router;

        let (status, settings) = call(
            router,
            "PATCH",
            "/settings",
            Some(json!({"notifications": false, "theme": "dark"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings, json!({"notifications": false, "theme": "dark"}));

        let (status, report) = call(
            router,
            "POST",
            "/import",
            Some(json!({
                "timeIntervals": [{
                    "id": "i-1",
                    "siteKey": "c.com",
                    "startedAt": T0_MS,
                    "endedAt": T0_MS + 30_000,
                    "durationSeconds": 30,
                    "date": "2025-03-01"
                }],
                "siteLimits": [{"siteKey": "c.com"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["timeIntervals"], 1);
        assert_eq!(report["skipped"], 1);

        let (_, exported) = call(router, "GET", "/export", None).await;
        assert_eq!(exported["timeIntervals"][0]["id"], "i-1");
        assert_eq!(exported["settings"]["theme"], "dark");
        assert!(exported["tabs"].as_array().unwrap().is_empty());

        let (_, rebuilt) = call(router, "POST", "/aggregates/c.com/recalculate", None).await;
        assert_eq!(rebuilt["totalSeconds"], 30);
        let (status, _) = call(router, "DELETE", "/aggregates/c.com", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, rebuilt) = call(router, "POST", "/aggregates/c.com/recalculate", None).await;
        assert_eq!(rebuilt["totalSeconds"], 30);

        let (_, removal) = call(router, "DELETE", "/sites/c.com", None).await;
        assert_eq!(removal["aggregateRemoved"], true);
        assert_eq!(removal["intervalsRemoved"], 1);

        let (_, notifications) = call(router, "GET", "/notifications", None).await;
        assert!(notifications.as_array().unwrap().is_empty());

        let (status, cleared) = call(router, "DELETE", "/data", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["settings"], 2);
        let (_, settings) = call(router, "GET", "/settings", None).await;
        assert_eq!(settings, json!({"notifications": true}));

        harness.tracker.shutdown().await.unwrap();
    }
}
