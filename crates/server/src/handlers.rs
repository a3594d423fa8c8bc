//! REST handlers.
//!
//! Handlers authenticate, consult the access policy and the rate
//! limiter, rewrite auth payloads (password hashing), and hand the rest
//! to the engine. The engine's sanitized records go to the wire as-is.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use plinth_engine::schema::AUTH_COLLECTIONS;
use plinth_engine::{ListOptions, ListResult};
use plinth_types::{PlinthError, Record, Schema, ValidationIssue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::access::{self, Action};
use crate::auth::{AuthIdentity, hash_password, verify_password};
use crate::error::ApiFailure;
use crate::state::AppState;

/// Default page size for list queries.
const DEFAULT_PER_PAGE: usize = 30;

/// Hard cap on page size.
const MAX_PER_PAGE: usize = 100;

// =============================================================================
// Auth
// =============================================================================

/// `POST /api/auth/login` body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Account email.
    pub email: String,
    /// Plaintext password, verified against the stored digest.
    pub password: String,
    /// Auth collection to log into (`users` or the superuser
    /// collection).
    #[serde(default = "default_auth_collection")]
    pub collection: String,
}

fn default_auth_collection() -> String {
    "users".to_string()
}

/// `POST /api/auth/login` — token + sanitized user, or 401.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiFailure> {
    if !AUTH_COLLECTIONS.contains(&body.collection.as_str()) {
        return Ok(unauthorized());
    }

    let found = state
        .engine
        .find_by_unique_raw(&body.collection, "email", &Value::from(body.email.clone()))
        .await?;
    let Some(user) = found else {
        return Ok(unauthorized());
    };

    let stored = user.get("password").and_then(Value::as_str).unwrap_or_default();
    if !verify_password(&body.password, stored) {
        return Ok(unauthorized());
    }

    let id = user.id().unwrap_or_default();
    let token = state.tokens.issue(&body.collection, id);
    let sanitized = sanitize_auth_record(&state, &body.collection, &user)?;
    info!(collection = %body.collection, user = id, "login succeeded");
    Ok(Json(json!({ "token": token, "user": sanitized })).into_response())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": "invalid_credentials", "message": "invalid email or password" })),
    )
        .into_response()
}

fn sanitize_auth_record(
    state: &AppState,
    collection: &str,
    record: &Record,
) -> Result<Record, PlinthError> {
    let private = match state.engine.schemas().get(collection)? {
        Some(schema) => schema.private_field_names().iter().map(|s| s.to_string()).collect(),
        None => vec!["password".to_string()],
    };
    let private: Vec<&str> = private.iter().map(String::as_str).collect();
    Ok(record.sanitized(&private))
}

// =============================================================================
// Records
// =============================================================================

/// `GET .../records` query string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// 1-based page.
    pub page: Option<usize>,
    /// Page size, capped at 100.
    pub per_page: Option<usize>,
    /// JSON object or `field=value`.
    pub filter: Option<String>,
    /// Sort field; `-` prefix descends.
    pub sort: Option<String>,
}

/// `GET /api/collections/{collection}/records`.
pub async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Json<ListResult>, ApiFailure> {
    let identity = state.tokens.identify(&headers);
    access::check(&collection, Action::List, None, identity.as_ref())?;

    let opts = ListOptions {
        filter: parse_filter(&collection, query.filter.as_deref())?,
        sort: query.sort,
        page: query.page.unwrap_or(1).max(1),
        per_page: query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
    };
    Ok(Json(state.engine.list(&collection, opts).await?))
}

/// `GET /api/collections/{collection}/records/{id}`.
pub async fn get_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Record>, ApiFailure> {
    let identity = state.tokens.identify(&headers);
    access::check(&collection, Action::Read, Some(&id), identity.as_ref())?;
    Ok(Json(state.engine.get(&collection, &id).await?))
}

/// `POST /api/collections/{collection}/records` — 201 with the
/// sanitized record.
pub async fn create_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Record>), ApiFailure> {
    let identity = state.tokens.identify(&headers);
    access::check(&collection, Action::Create, None, identity.as_ref())?;
    check_rate(&state, identity.as_ref())?;

    let mut record = as_object(&collection, body)?;
    rewrite_auth_payload(&collection, &mut record);
    let created = state.engine.create(&collection, record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PATCH /api/collections/{collection}/records/{id}` — optional
/// `_expectedVersion` in the body; 409 on conflict.
pub async fn update_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Record>, ApiFailure> {
    let identity = state.tokens.identify(&headers);
    access::check(&collection, Action::Write, Some(&id), identity.as_ref())?;
    check_rate(&state, identity.as_ref())?;

    let mut patch = as_object(&collection, body)?;
    let expected = take_expected_version(&mut patch);
    rewrite_auth_payload(&collection, &mut patch);
    Ok(Json(state.engine.update(&collection, &id, patch, expected).await?))
}

/// `DELETE .../records/{id}?version=N` query string.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Optional `_version` precondition.
    pub version: Option<i64>,
}

/// `DELETE /api/collections/{collection}/records/{id}`.
pub async fn delete_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    let identity = state.tokens.identify(&headers);
    access::check(&collection, Action::Write, Some(&id), identity.as_ref())?;
    check_rate(&state, identity.as_ref())?;

    state.engine.delete(&collection, &id, query.version).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

// =============================================================================
// Batch
// =============================================================================

/// `POST /api/batch` body.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    /// Operations, executed in order.
    pub requests: Vec<BatchItem>,
}

/// One batch operation.
#[derive(Debug, Deserialize)]
pub struct BatchItem {
    /// `create`, `update`, `delete`, or `get`.
    pub method: String,
    /// Target collection.
    pub collection: String,
    /// Target record for `update`/`delete`/`get`.
    pub id: Option<String>,
    /// Payload for `create`/`update` (may carry `_expectedVersion`).
    pub data: Option<Value>,
}

/// `POST /api/batch` — up to `MAX_BATCH_SIZE` operations; per-item
/// outcomes, never a partial HTTP failure.
pub async fn batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BatchRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let identity = state.tokens.identify(&headers);
    check_rate(&state, identity.as_ref())?;

    if body.requests.len() > state.max_batch_size {
        return Err(PlinthError::Validation {
            collection: "batch".to_string(),
            issues: vec![ValidationIssue::new(
                "requests",
                format!("at most {} operations per batch", state.max_batch_size),
            )],
        }
        .into());
    }

    let mut results = Vec::with_capacity(body.requests.len());
    for item in body.requests {
        let outcome = execute_batch_item(&state, identity.as_ref(), item).await;
        results.push(match outcome {
            Ok(result) => json!({ "success": true, "result": result }),
            Err(err) => json!({ "success": false, "error": err.to_string() }),
        });
    }
    Ok(Json(json!({ "results": results })))
}

async fn execute_batch_item(
    state: &AppState,
    identity: Option<&AuthIdentity>,
    item: BatchItem,
) -> Result<Value, PlinthError> {
    let collection = item.collection;
    let require_id = |id: &Option<String>| {
        id.clone().ok_or_else(|| PlinthError::Validation {
            collection: collection.clone(),
            issues: vec![ValidationIssue::new("id", "is required for this method")],
        })
    };

    match item.method.as_str() {
        "create" => {
            access::check(&collection, Action::Create, None, identity)?;
            let mut record = as_object(&collection, item.data.unwrap_or(Value::Null))?;
            rewrite_auth_payload(&collection, &mut record);
            Ok(state.engine.create(&collection, record).await?.into())
        },
        "update" => {
            let id = require_id(&item.id)?;
            access::check(&collection, Action::Write, Some(&id), identity)?;
            let mut patch = as_object(&collection, item.data.unwrap_or(Value::Null))?;
            let expected = take_expected_version(&mut patch);
            rewrite_auth_payload(&collection, &mut patch);
            Ok(state.engine.update(&collection, &id, patch, expected).await?.into())
        },
        "delete" => {
            let id = require_id(&item.id)?;
            access::check(&collection, Action::Write, Some(&id), identity)?;
            state.engine.delete(&collection, &id, None).await?;
            Ok(json!({ "id": id }))
        },
        "get" => {
            let id = require_id(&item.id)?;
            access::check(&collection, Action::Read, Some(&id), identity)?;
            Ok(state.engine.get(&collection, &id).await?.into())
        },
        other => Err(PlinthError::Validation {
            collection: collection.clone(),
            issues: vec![ValidationIssue::new("method", format!("unknown method {other:?}"))],
        }),
    }
}

// =============================================================================
// Schemas (superuser administration)
// =============================================================================

/// `GET /api/schemas`.
pub async fn list_schemas(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    require_superuser(&state, &headers)?;
    let mut out = Map::new();
    for (collection, schema) in state.engine.schemas().list()? {
        out.insert(collection, serde_json::to_value(&*schema).unwrap_or(Value::Null));
    }
    Ok(Json(Value::Object(out)))
}

/// `GET /api/schemas/{collection}`.
pub async fn get_schema(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Schema>, ApiFailure> {
    require_superuser(&state, &headers)?;
    let schema = state.engine.schemas().get(&collection)?.ok_or_else(|| {
        PlinthError::NotFound { collection: collection.clone(), id: "schema".to_string() }
    })?;
    Ok(Json((*schema).clone()))
}

/// `PUT /api/schemas/{collection}`.
pub async fn put_schema(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(schema): Json<Schema>,
) -> Result<Json<Schema>, ApiFailure> {
    require_superuser(&state, &headers)?;
    let stored = state.engine.schemas().put(&collection, schema)?;
    info!(collection = %collection, "schema updated");
    Ok(Json((*stored).clone()))
}

fn require_superuser(state: &AppState, headers: &HeaderMap) -> Result<(), ApiFailure> {
    let identity = state.tokens.identify(headers);
    if identity.is_some_and(|i| i.is_superuser()) {
        Ok(())
    } else {
        Err(PlinthError::Forbidden {
            reason: "schema administration requires a superuser token".to_string(),
        }
        .into())
    }
}

// =============================================================================
// Stats & health
// =============================================================================

/// `GET /api/stats`.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "cache": state.engine.cache_stats(),
        "engine": state.engine.stats(),
        "realtime_subscribers": state.broadcaster.subscriber_count(),
        "rate_limited_clients": state.limiter.client_count(),
    }))
}

/// `GET /api/stats/buffer`.
pub async fn buffer_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.buffer.stats()))
}

/// `GET /health`.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// =============================================================================
// Helpers
// =============================================================================

fn check_rate(state: &AppState, identity: Option<&AuthIdentity>) -> Result<(), ApiFailure> {
    let key = identity.map_or("anonymous", |i| i.record_id.as_str());
    state
        .limiter
        .check(key)
        .map_err(|rejection| ApiFailure::RateLimited { retry_after_ms: rejection.retry_after_ms })
}

fn as_object(collection: &str, value: Value) -> Result<Record, PlinthError> {
    Record::from_value(value).ok_or_else(|| PlinthError::Validation {
        collection: collection.to_string(),
        issues: vec![ValidationIssue::new("body", "must be a JSON object")],
    })
}

/// Pops `_expectedVersion` (number or numeric string) out of a patch.
fn take_expected_version(patch: &mut Record) -> Option<i64> {
    patch.remove("_expectedVersion").and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

/// Replaces a plaintext `password` with its salted digest on auth
/// collections. The engine stores whatever it is given.
fn rewrite_auth_payload(collection: &str, record: &mut Record) {
    if !AUTH_COLLECTIONS.contains(&collection) {
        return;
    }
    if let Some(Value::String(plaintext)) = record.get("password").cloned() {
        record.insert("password", Value::from(hash_password(&plaintext)));
    }
}

/// Parses the `filter` query parameter: a JSON object, or `field=value`.
fn parse_filter(collection: &str, raw: Option<&str>) -> Result<Map<String, Value>, PlinthError> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Ok(Map::new());
    };
    if let Ok(Value::Object(map)) = serde_json::from_str(raw) {
        return Ok(map);
    }
    if let Some((field, value)) = raw.split_once('=') {
        let mut map = Map::new();
        // Bare values arrive as strings; loose equality coerces numbers.
        map.insert(field.to_string(), Value::from(value));
        return Ok(map);
    }
    Err(PlinthError::Validation {
        collection: collection.to_string(),
        issues: vec![ValidationIssue::new("filter", "expected JSON object or field=value")],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter_forms() {
        assert!(parse_filter("posts", None).unwrap().is_empty());
        assert!(parse_filter("posts", Some("")).unwrap().is_empty());

        let json_form = parse_filter("posts", Some(r#"{"owner_id":"u1","views":3}"#)).unwrap();
        assert_eq!(json_form.get("owner_id"), Some(&json!("u1")));
        assert_eq!(json_form.get("views"), Some(&json!(3)));

        let pair_form = parse_filter("posts", Some("owner_id=u1")).unwrap();
        assert_eq!(pair_form.get("owner_id"), Some(&json!("u1")));

        assert!(parse_filter("posts", Some("not a filter")).is_err());
    }

    #[test]
    fn test_take_expected_version_forms() {
        let mut patch =
            Record::from_value(json!({"_expectedVersion": 3, "title": "x"})).unwrap();
        assert_eq!(take_expected_version(&mut patch), Some(3));
        assert!(!patch.contains("_expectedVersion"));

        let mut patch = Record::from_value(json!({"_expectedVersion": "7"})).unwrap();
        assert_eq!(take_expected_version(&mut patch), Some(7));

        let mut patch = Record::from_value(json!({"title": "x"})).unwrap();
        assert_eq!(take_expected_version(&mut patch), None);
    }

    #[test]
    fn test_rewrite_auth_payload_only_touches_auth_collections() {
        let mut user = Record::from_value(json!({"password": "pw"})).unwrap();
        rewrite_auth_payload("users", &mut user);
        let stored = user.get("password").and_then(Value::as_str).unwrap();
        assert_ne!(stored, "pw");
        assert!(verify_password("pw", stored));

        let mut post = Record::from_value(json!({"password": "pw"})).unwrap();
        rewrite_auth_payload("posts", &mut post);
        assert_eq!(post.get("password"), Some(&json!("pw")));
    }
}
