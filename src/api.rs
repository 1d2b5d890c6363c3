// Read API - daily summary over HTTP (feature "server")

use crate::db::Store;
use crate::summary::get_daily_summary;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

const DEFAULT_PAGE: u32 = 1;
const DEFAULT_SIZE: u32 = 20;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    store: Store,
    /// Zone in which "yesterday" is resolved when no date is given
    timezone: Tz,
}

impl AppState {
    pub fn new(store: Store, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    fn yesterday(&self) -> NaiveDate {
        let today = Utc::now().with_timezone(&self.timezone).date_naive();
        today.pred_opt().unwrap_or(today)
    }
}

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/accounts/daily-summary", get(daily_summary))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Debug, Serialize)]
struct Envelope {
    time: String,
    code: u16,
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<&'static str>,
    data: serde_json::Value,
}

fn respond(status: StatusCode, message: String, exception: Option<&'static str>, data: serde_json::Value) -> Response {
    let label = match status {
        StatusCode::OK => "OK",
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        _ => "INTERNAL_SERVER_ERROR",
    };

    let body = Envelope {
        time: Utc::now().to_rfc3339(),
        code: status.as_u16(),
        status: label,
        message,
        exception,
        data,
    };

    (status, Json(body)).into_response()
}

// ============================================================================
// Query validation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DailySummaryParams {
    page: Option<String>,
    size: Option<String>,
    #[serde(rename = "accountId")]
    account_id: Option<String>,
    date: Option<String>,
}

#[derive(Debug, PartialEq)]
struct DailySummaryQuery {
    balance_date: NaiveDate,
    account_id: Option<i64>,
    page: u32,
    size: u32,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_positive(name: &'static str, raw: Option<&str>, default: u32, violations: &mut Vec<(&'static str, String)>) -> u32 {
    match raw.map(str::parse::<i64>) {
        None => default,
        Some(Ok(n)) if n >= 1 && n <= i64::from(u32::MAX) => n as u32,
        Some(Ok(_)) => {
            violations.push((name, format!("{name} must be greater than 0")));
            default
        }
        Some(Err(_)) => {
            violations.push((name, format!("{name} must be a number")));
            default
        }
    }
}

impl DailySummaryParams {
    /// Collect every violation instead of stopping at the first
    fn validate(&self, default_date: NaiveDate) -> std::result::Result<DailySummaryQuery, String> {
        let mut violations: Vec<(&'static str, String)> = Vec::new();

        let page = parse_positive("page", non_blank(&self.page), DEFAULT_PAGE, &mut violations);
        let size = parse_positive("size", non_blank(&self.size), DEFAULT_SIZE, &mut violations);

        let account_id = match non_blank(&self.account_id).map(str::parse::<i64>) {
            None => None,
            Some(Ok(id)) => Some(id),
            Some(Err(_)) => {
                violations.push(("accountId", "accountId must be a number".to_string()));
                None
            }
        };

        let balance_date = match non_blank(&self.date) {
            None => default_date,
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap_or_else(|_| {
                violations.push(("date", format!("date must be YYYY-MM-DD, got '{raw}'")));
                default_date
            }),
        };

        if violations.is_empty() {
            return Ok(DailySummaryQuery {
                balance_date,
                account_id,
                page,
                size,
            });
        }

        violations.sort_by(|a, b| a.0.cmp(b.0));
        Err(violations
            .into_iter()
            .map(|(name, message)| format!("{name} : {message}"))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    respond(StatusCode::OK, "OK".to_string(), None, serde_json::json!({}))
}

/// GET /api/accounts/daily-summary
async fn daily_summary(State(state): State<AppState>, Query(params): Query<DailySummaryParams>) -> Response {
    let query = match params.validate(state.yesterday()) {
        Ok(query) => query,
        Err(message) => {
            tracing::debug!(%message, "Rejected daily summary request");
            return respond(StatusCode::BAD_REQUEST, message, Some("ValidationError"), serde_json::json!({}));
        }
    };

    let result = state
        .store
        .call(move |conn| get_daily_summary(conn, query.balance_date, query.account_id, query.page, query.size))
        .await;

    match result {
        Ok(accounts) => respond(
            StatusCode::OK,
            "Daily summary retrieved".to_string(),
            None,
            serde_json::json!({ "accounts": accounts }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Daily summary query failed");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                Some("BatchError"),
                serde_json::json!({}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_transaction, Transaction};
    use crate::test_support::{date, seed_accounts, temp_store};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn params(page: Option<&str>, size: Option<&str>, account_id: Option<&str>, date: Option<&str>) -> DailySummaryParams {
        DailySummaryParams {
            page: page.map(String::from),
            size: size.map(String::from),
            account_id: account_id.map(String::from),
            date: date.map(String::from),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_validation_defaults() {
        let fallback = date(2024, 5, 1);
        let query = params(None, None, None, Some("  ")).validate(fallback).unwrap();

        assert_eq!(
            query,
            DailySummaryQuery {
                balance_date: fallback,
                account_id: None,
                page: 1,
                size: 20,
            }
        );
    }

    #[test]
    fn test_validation_collects_sorted_violations() {
        let message = params(Some("0"), Some("-1"), Some("abc"), Some("2024-13-01"))
            .validate(date(2024, 5, 1))
            .unwrap_err();

        let names: Vec<&str> = message
            .split("; ")
            .map(|part| part.split(" : ").next().unwrap())
            .collect();
        assert_eq!(names, vec!["accountId", "date", "page", "size"]);
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, store) = temp_store(1);
        let app = router(AppState::new(store, chrono_tz::America::Toronto));

        let (status, body) = get_json(app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
    }

    #[tokio::test]
    async fn test_daily_summary_endpoint() {
        let (_dir, store) = temp_store(2);
        {
            let conn = store.conn().unwrap();
            seed_accounts(&conn, &[(1, 1_000), (2, 500)]);
            insert_transaction(&conn, &Transaction::validated(2, 75, date(2024, 5, 1))).unwrap();
        }
        let app = router(AppState::new(store, chrono_tz::America::Toronto));

        let (status, body) = get_json(app.clone(), "/api/accounts/daily-summary?date=2024-05-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        let accounts = body["data"]["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[1]["accountId"], 2);
        assert_eq!(accounts[1]["totalTransactions"], 75);

        let (_, body) = get_json(app, "/api/accounts/daily-summary?date=2024-05-01&accountId=1&size=5").await;
        assert_eq!(body["data"]["accounts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_summary_rejects_bad_params() {
        let (_dir, store) = temp_store(1);
        let app = router(AppState::new(store, chrono_tz::America::Toronto));

        let (status, body) = get_json(app, "/api/accounts/daily-summary?page=0&size=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert_eq!(body["status"], "BAD_REQUEST");
        assert_eq!(body["exception"], "ValidationError");
        assert_eq!(body["data"], serde_json::json!({}));
        assert_eq!(
            body["message"],
            "page : page must be greater than 0; size : size must be greater than 0"
        );
    }
}
