use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post, put},
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::Config;
use crate::engine::CommissionEngine;
use crate::error::ApiErrorWithMeta;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::types::{
    AccrualOutcome, Ambassador, CompletedPurchase, Dashboard, LedgerEntry, PayoutRequest,
    PayoutStatus, PayoutType, RefundEvent, ReversalOutcome, SignupOutcome, Tier, TierUpdate,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The commission engine over the configured store.
    pub engine: CommissionEngine,
    /// The application configuration.
    pub config: Config,
}

/// The request to enroll an ambassador.
#[derive(Deserialize)]
pub struct EnrollRequest {
    /// The user id the ambassador account belongs to.
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
}

/// A new customer signed up with an ambassador's code.
#[derive(Deserialize)]
pub struct SignupRequest {
    pub customer_id: i64,
}

/// A completed sale by a referred customer.
#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub transaction_id: String,
    pub customer_id: Option<i64>,
    pub subtotal: Decimal,
}

/// A refund or void of a commissioned sale.
#[derive(Deserialize)]
pub struct RefundRequest {
    pub original_transaction_id: String,
    pub original_subtotal: Decimal,
    pub original_commission: Decimal,
    /// Omitted for a full void.
    pub refund_amount: Option<Decimal>,
}

#[derive(Deserialize)]
pub struct PayoutCreateRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub payout_type: PayoutType,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub approved_by: i64,
}

#[derive(Deserialize)]
pub struct PayoutQuery {
    pub status: Option<PayoutStatus>,
}

type ApiResult<T> = Result<ApiOk<T>, ApiErrorWithMeta>;

pub fn init_router(state: AppState) -> Router {
    let ambassadors = Router::new()
        .route("/", post(enroll_handler))
        .route("/{id}/dashboard", get(dashboard_handler))
        .route("/{id}/ledger", get(ledger_handler))
        .route("/{id}/referrals", post(signup_handler))
        .route("/{id}/purchases", post(purchase_handler))
        .route("/{id}/refunds", post(refund_handler))
        .route("/{id}/payouts", post(request_payout_handler));

    let admin = Router::new()
        .route("/payouts", get(list_payouts_handler))
        .route("/payouts/{id}/approve", post(approve_payout_handler))
        .route("/payouts/{id}/paid", post(mark_paid_handler))
        .route("/payouts/{id}/cancel", post(cancel_payout_handler))
        .route("/tiers/{id}", put(update_tier_handler));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/tiers", get(list_tiers_handler))
        .nest("/ambassadors", ambassadors)
        .nest("/admin", admin)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn enroll_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<Ambassador> {
    let ambassador = st
        .engine
        .enroll_ambassador(req.id, &req.first_name, &req.last_name)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("ambassador enrolled", ambassador, meta))
}

async fn dashboard_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Dashboard> {
    let dashboard = st
        .engine
        .get_dashboard(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("dashboard fetched", dashboard, meta))
}

async fn ledger_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Vec<LedgerEntry>> {
    let entries = st
        .engine
        .ledger(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("ledger fetched", entries, meta))
}

async fn signup_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<SignupOutcome> {
    let outcome = st
        .engine
        .on_referral_signup(id, req.customer_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("referral recorded", outcome, meta))
}

async fn purchase_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<AccrualOutcome> {
    let purchase = CompletedPurchase {
        ambassador_id: id,
        transaction_id: req.transaction_id,
        customer_id: req.customer_id,
        subtotal: req.subtotal,
    };
    let outcome = st
        .engine
        .on_purchase_completed(purchase)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("commission accrued", outcome, meta))
}

async fn refund_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<ReversalOutcome> {
    let result = match req.refund_amount {
        Some(refund_amount) => {
            st.engine
                .on_purchase_voided_or_refunded(RefundEvent {
                    ambassador_id: id,
                    original_transaction_id: req.original_transaction_id,
                    original_subtotal: req.original_subtotal,
                    original_commission: req.original_commission,
                    refund_amount,
                })
                .await
        }
        None => {
            st.engine
                .on_purchase_voided(
                    id,
                    &req.original_transaction_id,
                    req.original_subtotal,
                    req.original_commission,
                )
                .await
        }
    };
    let outcome = result.map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("commission reversed", outcome, meta))
}

async fn request_payout_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<PayoutCreateRequest>,
) -> ApiResult<PayoutRequest> {
    let payout = st
        .engine
        .request_payout(id, req.amount, req.payout_type)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("payout requested", payout, meta))
}

async fn list_payouts_handler(
    State(st): State<AppState>,
    Query(query): Query<PayoutQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Vec<PayoutRequest>> {
    let payouts = st
        .engine
        .list_payouts(query.status)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("payouts fetched", payouts, meta))
}

async fn approve_payout_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<PayoutRequest> {
    let payout = st
        .engine
        .approve_payout(id, req.approved_by)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("payout approved", payout, meta))
}

async fn mark_paid_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<PayoutRequest> {
    let payout = st
        .engine
        .mark_payout_paid(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("payout paid", payout, meta))
}

async fn cancel_payout_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<PayoutRequest> {
    let payout = st
        .engine
        .cancel_payout(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("payout cancelled", payout, meta))
}

async fn list_tiers_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Vec<Tier>> {
    let tiers = st
        .engine
        .list_tiers()
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("tiers fetched", tiers, meta))
}

async fn update_tier_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(update): Json<TierUpdate>,
) -> ApiResult<Tier> {
    let tier = st
        .engine
        .update_tier(id, update)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("tier updated", tier, meta))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::store::MemoryStore;
    use crate::tiers::default_tiers;

    fn app() -> Router {
        let config = Config {
            server_port: 0,
            database_url: String::new(),
            referral_base_url: "https://candiez.shop".into(),
            db_max_connections: 1,
        };
        let engine = CommissionEngine::new(
            Arc::new(MemoryStore::new(default_tiers())),
            config.referral_base_url.clone(),
        );
        init_router(AppState { engine, config })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn enrolled() -> Router {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/ambassadors",
            Some(json!({"id": 1, "first_name": "Admin", "last_name": "User"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["referral_code"], "ADUS0001");
        app
    }

    #[tokio::test]
    async fn dashboard_reports_code_link_and_tier() {
        let app = enrolled().await;
        let (status, body) = call(&app, "GET", "/ambassadors/1/dashboard", None).await;
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["referral_link"], "https://candiez.shop/signup?ref=ADUS0001");
        assert_eq!(data["current_tier"]["name"], "Member");
        assert_eq!(data["next_tier"]["name"], "Promoter");
        assert_eq!(data["stats"]["total_referrals"], 0);
        assert!(body["meta"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn purchase_refund_and_payout_round() {
        let app = enrolled().await;
        let (status, body) = call(
            &app,
            "POST",
            "/ambassadors/1/purchases",
            Some(json!({"transaction_id": "t1", "subtotal": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["commission"], json!(5.0));

        let (status, body) = call(
            &app,
            "POST",
            "/ambassadors/1/refunds",
            Some(json!({
                "original_transaction_id": "t1",
                "original_subtotal": 100,
                "original_commission": 5,
                "refund_amount": 50
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["reversed"], json!(2.5));

        let (status, body) = call(
            &app,
            "POST",
            "/ambassadors/1/payouts",
            Some(json!({"amount": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INSUFFICIENT_BALANCE");

        let (status, body) = call(
            &app,
            "POST",
            "/ambassadors/1/payouts",
            Some(json!({"amount": 2, "payout_type": "cash"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let payout_id = body["data"]["id"].as_i64().unwrap();
        assert_eq!(body["data"]["status"], "pending");

        let (status, body) = call(&app, "POST", &format!("/admin/payouts/{payout_id}/paid"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_TRANSITION");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/admin/payouts/{payout_id}/approve"),
            Some(json!({"approved_by": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "POST", &format!("/admin/payouts/{payout_id}/paid"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "paid");

        let (_, body) = call(&app, "GET", "/admin/payouts?status=paid", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&app, "GET", "/ambassadors/1/ledger", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_ambassador_is_404() {
        let app = app();
        let (status, body) = call(&app, "GET", "/ambassadors/5/dashboard", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn tiers_can_be_listed_and_updated() {
        let app = app();
        let (status, body) = call(&app, "GET", "/tiers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 4);

        let (status, body) = call(
            &app,
            "PUT",
            "/admin/tiers/4",
            Some(json!({"commission_rate": 0.2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["commission_rate"], json!(0.2));

        let (status, body) = call(
            &app,
            "PUT",
            "/admin/tiers/4",
            Some(json!({"commission_rate": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_TIER");
    }
}
