//! HTTP API
//!
//! - `GET  /health`                 liveness
//! - `POST /sync-chat`              analyse a chat session, schedule a follow-up
//! - `GET  /pending-tasks`          pending follow-ups
//! - `GET  /followups/{id}`         one follow-up
//! - `POST /followups/{id}/cancel`  cancel a pending follow-up
//! - `GET|POST /whatsapp/webhook`   WhatsApp Cloud API webhook

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::{ChatTurn, ConversationAnalyzer, RiskAssessment};
use crate::followup::{FollowUpPlan, FollowUpStore, ScheduledFollowUp};
use crate::scheduler::{FollowUpScheduler, ScheduledHandle};
use crate::webhook::{extract_text_message, verify_subscription, WhatsAppResponder};

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<FollowUpScheduler>,
    pub analyzer: Arc<dyn ConversationAnalyzer>,
    pub responder: Arc<WhatsAppResponder>,
    pub verify_token: Option<String>,
}

impl AppState {
    fn store(&self) -> &Arc<dyn FollowUpStore> {
        self.scheduler.store()
    }
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sync-chat", post(sync_chat))
        .route("/pending-tasks", get(pending_tasks))
        .route("/followups/{id}", get(get_followup))
        .route("/followups/{id}/cancel", post(cancel_followup))
        .route(
            "/whatsapp/webhook",
            get(whatsapp_verify).post(whatsapp_webhook),
        )
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// JSON error body with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!("Request failed: {:#}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{:#}", err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "Bremi Memory Service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Chat sync
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncChatRequest {
    pub user_id: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Every section is independent; a failed section leaves an `*_error` marker
#[derive(Debug, Default, Serialize)]
pub struct SyncChatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup_plan: Option<FollowUpPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_followup: Option<ScheduledHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup_error: Option<String>,
}

/// Minimum history length before a title is suggested
const TITLE_MIN_MESSAGES: usize = 2;

async fn sync_chat(
    State(state): State<AppState>,
    Json(request): Json<SyncChatRequest>,
) -> Json<SyncChatResponse> {
    let user_id = request.user_id.trim().to_string();
    let history = Arc::new(request.history);
    let mut response = SyncChatResponse::default();

    info!(
        "🔄 Syncing chat for {} ({} messages)",
        user_id,
        history.len()
    );

    // Both analyses run concurrently; a panic in one only fails its own section
    let risk_task = {
        let analyzer = state.analyzer.clone();
        let history = history.clone();
        tokio::spawn(async move { analyzer.analyze_session(&history).await })
    };
    let followup_task = {
        let analyzer = state.analyzer.clone();
        let history = history.clone();
        tokio::spawn(async move { analyzer.analyze_for_followup(&history).await })
    };

    match risk_task.await {
        Ok(risk) => {
            if risk.is_critical {
                warn!(
                    "🚨 CRITICAL RISK DETECTED for user {}: {} ({})",
                    user_id,
                    risk.risk_level,
                    risk.detected_keys.join(", ")
                );
            }
            response.risk_assessment = Some(risk);
        }
        Err(e) => {
            error!("Risk analysis task failed: {}", e);
            response.risk_assessment = Some(RiskAssessment::manual_review(&e));
            response.risk_error = Some(e.to_string());
        }
    }

    match followup_task.await {
        Ok(plan) => {
            match state
                .scheduler
                .schedule(&plan, &user_id, request.user_email.as_deref())
            {
                Ok(outcome) => response.scheduled_followup = outcome.handle(),
                Err(e) => {
                    error!("Failed to schedule follow-up for {}: {:#}", user_id, e);
                    response.followup_error = Some(format!("{:#}", e));
                }
            }
            response.followup_plan = Some(plan);
        }
        Err(e) => {
            error!("Follow-up analysis task failed: {}", e);
            response.followup_error = Some(e.to_string());
        }
    }

    if history.len() >= TITLE_MIN_MESSAGES {
        response.suggested_title = Some(state.analyzer.generate_title(&history).await);
    }

    Json(response)
}

// ============================================================================
// Follow-ups
// ============================================================================

async fn pending_tasks(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduledFollowUp>>, ApiError> {
    let pending = state.store().pending().map_err(ApiError::internal)?;
    Ok(Json(pending))
}

async fn get_followup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduledFollowUp>, ApiError> {
    state
        .store()
        .get(id)
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Follow-up {} not found", id)))
}

async fn cancel_followup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduledFollowUp>, ApiError> {
    if !state.scheduler.cancel(id).map_err(ApiError::internal)? {
        return Err(ApiError::not_found(format!(
            "No pending follow-up {}",
            id
        )));
    }

    state
        .store()
        .get(id)
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Follow-up {} not found", id)))
}

// ============================================================================
// WhatsApp webhook
// ============================================================================

async fn whatsapp_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let challenge = verify_subscription(
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
        state.verify_token.as_deref(),
    );

    match challenge {
        Some(challenge) => {
            info!("WhatsApp webhook verified");
            (StatusCode::OK, challenge.to_string()).into_response()
        }
        None => {
            warn!("WhatsApp webhook verification rejected");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
    }
}

/// Acknowledges immediately; the reply is produced in a background task
async fn whatsapp_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    if let Some(message) = extract_text_message(&payload) {
        let responder = state.responder.clone();
        tokio::spawn(async move {
            if let Err(e) = responder.handle_incoming(&message).await {
                error!("WhatsApp reply failed: {:#}", e);
            }
        });
    }

    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::FakeAnalyzer;
    use crate::analysis::RiskLevel;
    use crate::followup::{FollowUpStatus, InMemoryFollowUpStore};
    use crate::storage::InMemoryChatHistoryStore;
    use crate::webhook::tests::{text_payload, RecordingMessenger};
    use std::time::Duration;

    struct Harness {
        state: AppState,
        store: Arc<InMemoryFollowUpStore>,
        messenger: Arc<RecordingMessenger>,
    }

    fn harness(analyzer: FakeAnalyzer) -> Harness {
        let store = Arc::new(InMemoryFollowUpStore::new());
        let analyzer: Arc<dyn ConversationAnalyzer> = Arc::new(analyzer);
        let messenger = Arc::new(RecordingMessenger::default());
        let responder = Arc::new(WhatsAppResponder::new(
            Arc::new(InMemoryChatHistoryStore::new()),
            analyzer.clone(),
            messenger.clone(),
        ));
        let state = AppState {
            scheduler: Arc::new(FollowUpScheduler::new(store.clone(), false)),
            analyzer,
            responder,
            verify_token: Some("verify-me".to_string()),
        };
        Harness {
            state,
            store,
            messenger,
        }
    }

    fn interview_plan() -> FollowUpPlan {
        FollowUpPlan {
            needs_followup: true,
            topic: "Job Interview".to_string(),
            context_summary: "User has an interview tomorrow".to_string(),
            suggested_delay_hours: 24,
            email_draft: "How did it go?".to_string(),
        }
    }

    fn request(history: Vec<ChatTurn>, email: Option<&str>) -> SyncChatRequest {
        SyncChatRequest {
            user_id: "user-1".to_string(),
            history,
            user_email: email.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let Json(health) = health_check().await;
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn test_sync_chat_schedules_followup() {
        let h = harness(FakeAnalyzer {
            plan: interview_plan(),
            title: "Interview Nerves".to_string(),
            ..Default::default()
        });
        let history = vec![
            ChatTurn::new("user", "I have a job interview tomorrow"),
            ChatTurn::new("model", "You've got this!"),
        ];

        let Json(response) = sync_chat(
            State(h.state.clone()),
            Json(request(history, Some("ada@example.com"))),
        )
        .await;

        let handle = response.scheduled_followup.expect("scheduled");
        assert_eq!(handle.topic, "Job Interview");
        assert_eq!(response.suggested_title.as_deref(), Some("Interview Nerves"));
        assert!(response.followup_error.is_none());

        let pending = h.store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, handle.id);
        assert_eq!(pending[0].user_email.as_deref(), Some("ada@example.com"));
        assert_eq!(
            pending[0].scheduled_time - pending[0].created_at,
            chrono::Duration::hours(24)
        );
    }

    /// Risk analysis panics; everything else delegates to a scripted analyzer
    struct PanickingRisk(FakeAnalyzer);

    #[async_trait::async_trait]
    impl ConversationAnalyzer for PanickingRisk {
        async fn analyze_for_followup(&self, history: &[ChatTurn]) -> FollowUpPlan {
            self.0.analyze_for_followup(history).await
        }

        async fn analyze_session(&self, _history: &[ChatTurn]) -> RiskAssessment {
            panic!("risk model exploded")
        }

        async fn generate_response(
            &self,
            history: &[ChatTurn],
            input: &str,
            language: &str,
        ) -> String {
            self.0.generate_response(history, input, language).await
        }

        async fn generate_title(&self, history: &[ChatTurn]) -> String {
            self.0.generate_title(history).await
        }
    }

    #[tokio::test]
    async fn test_sync_chat_risk_fallback_still_schedules() {
        let mut h = harness(FakeAnalyzer::default());
        h.state.analyzer = Arc::new(PanickingRisk(FakeAnalyzer {
            plan: interview_plan(),
            ..Default::default()
        }));

        let Json(response) = sync_chat(
            State(h.state.clone()),
            Json(request(vec![ChatTurn::new("user", "interview tomorrow")], None)),
        )
        .await;

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["risk_error"].as_str().unwrap().contains("panic"));
        assert_eq!(json["risk_assessment"]["risk_level"], "UNKNOWN");
        assert!(json.get("suggested_title").is_none());
        assert_eq!(json["followup_plan"]["topic"], "Job Interview");

        let risk = response.risk_assessment.expect("risk section present");
        assert_eq!(risk.risk_level, RiskLevel::Unknown);
        assert_eq!(risk.detected_keys, vec!["error_analyzing"]);
        assert!(risk.needs_followup);
        assert!(response.scheduled_followup.is_some());
        // One message is not enough context for a title
        assert!(response.suggested_title.is_none());
    }

    #[tokio::test]
    async fn test_sync_chat_without_followup() {
        let h = harness(FakeAnalyzer::default());
        let Json(response) = sync_chat(
            State(h.state.clone()),
            Json(request(vec![ChatTurn::new("user", "hi")], None)),
        )
        .await;

        assert!(response.scheduled_followup.is_none());
        assert_eq!(response.followup_plan, Some(FollowUpPlan::none()));
        assert!(h.store.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_and_cancel_followup() {
        let h = harness(FakeAnalyzer::default());
        let record = h
            .state
            .scheduler
            .schedule(&interview_plan(), "user-1", None)
            .unwrap()
            .record()
            .cloned()
            .unwrap();

        let Json(fetched) = get_followup(State(h.state.clone()), Path(record.id))
            .await
            .unwrap();
        assert_eq!(fetched.id, record.id);

        let Json(cancelled) = cancel_followup(State(h.state.clone()), Path(record.id))
            .await
            .unwrap();
        assert_eq!(cancelled.status, FollowUpStatus::Cancelled);

        let again = cancel_followup(State(h.state.clone()), Path(record.id)).await;
        assert_eq!(again.unwrap_err().status, StatusCode::NOT_FOUND);

        let missing = get_followup(State(h.state.clone()), Path(Uuid::new_v4())).await;
        assert_eq!(missing.unwrap_err().status, StatusCode::NOT_FOUND);

        let Json(pending) = pending_tasks(State(h.state.clone())).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_verification() {
        let h = harness(FakeAnalyzer::default());
        let params = |token: &str| {
            Query(HashMap::from([
                ("hub.mode".to_string(), "subscribe".to_string()),
                ("hub.verify_token".to_string(), token.to_string()),
                ("hub.challenge".to_string(), "1158201444".to_string()),
            ]))
        };

        let ok = whatsapp_verify(State(h.state.clone()), params("verify-me")).await;
        assert_eq!(ok.status(), StatusCode::OK);

        let rejected = whatsapp_verify(State(h.state.clone()), params("nope")).await;
        assert_eq!(rejected.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_router_end_to_end() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let h = harness(FakeAnalyzer::default());
        let app = router(h.state.clone(), &["http://localhost:3000".to_string()]);

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let body = axum::body::to_bytes(health.into_body(), 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["service"], "Bremi Memory Service");

        let verify = app
            .clone()
            .oneshot(
                Request::get(
                    "/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=42",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(verify.status(), StatusCode::OK);
        let body = axum::body::to_bytes(verify.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"42");

        let sync = app
            .clone()
            .oneshot(
                Request::post("/sync-chat")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"user_id":"u1","history":[{"role":"user","text":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(sync.status(), StatusCode::OK);

        let cancel = app
            .oneshot(
                Request::post(format!("/followups/{}/cancel", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_and_replies_in_background() {
        let h = harness(FakeAnalyzer {
            reply: "I dey here for you".to_string(),
            ..Default::default()
        });

        let Json(ack) = whatsapp_webhook(
            State(h.state.clone()),
            Json(text_payload("2348000000000", "Hello", "wamid.1")),
        )
        .await;
        assert_eq!(ack["status"], "ok");

        for _ in 0..50 {
            if !h.messenger.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *h.messenger.sent.lock().unwrap(),
            vec![("2348000000000".to_string(), "I dey here for you".to_string())]
        );
    }
}
