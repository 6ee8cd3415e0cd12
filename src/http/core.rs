use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{AdminGrant, AuthError, Authorizer, CurrentUser, IdentityProvider};
use crate::credentials::CredentialError;
use crate::overrides::OverrideError;
use crate::resolver::ResolutionError;
use crate::service::{KeyFailure, KeyService};
use crate::store::{DayRange, StoreError};
use crate::types::{
    AdminOverride, CredentialStatus, OverrideConfig, UsageEvent, UsageLimits, UsageMetrics,
    UsageReport, UserUsageSummary,
};
use crate::usage::UsageError;
use crate::usage::rollup::parse_day;
use crate::KeyledgerError;

#[derive(Clone)]
pub struct KeyledgerHttpState {
    service: KeyService,
    identity: Arc<dyn IdentityProvider>,
    authorizer: Authorizer,
}

impl KeyledgerHttpState {
    pub fn new(service: KeyService, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            service,
            identity,
            authorizer: Authorizer::default(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Authorizer) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn service(&self) -> &KeyService {
        &self.service
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: KeyledgerHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/keys", put(handle_set_key).delete(handle_remove_key))
        .route("/v1/keys/status", get(handle_key_status))
        .route("/v1/keys/failure", post(handle_key_failure))
        .route("/v1/usage", post(handle_log_usage).get(handle_list_usage))
        .route("/v1/usage/metrics", get(handle_usage_metrics))
        .route("/admin/usage", get(handle_all_users_usage))
        .route("/admin/users/:user_id/usage", get(handle_user_usage))
        .route(
            "/admin/users/:user_id/override",
            put(handle_set_override).delete(handle_remove_override),
        )
        .route("/admin/users/:user_id/limits", put(handle_set_limits))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
                retryable: false,
            },
        }),
    )
}

fn store_error_response(err: &StoreError) -> HttpError {
    if err.is_retryable() {
        tracing::error!("store unavailable: {err}");
        let (status, Json(mut body)) = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "storage is temporarily unavailable; retry later",
        );
        body.error.retryable = true;
        (status, Json(body))
    } else {
        tracing::error!("store failure: {err}");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal storage error",
        )
    }
}

fn map_error(err: KeyledgerError) -> HttpError {
    match err {
        KeyledgerError::Auth(AuthError::Unauthenticated) => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "sign in required",
        ),
        KeyledgerError::Auth(AuthError::Forbidden) => {
            error_response(StatusCode::FORBIDDEN, "forbidden", "admin role required")
        }
        KeyledgerError::Credential(CredentialError::Validation(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_api_key", message)
        }
        KeyledgerError::Credential(CredentialError::NotFound) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "no api key configured",
        ),
        KeyledgerError::Credential(CredentialError::Decryption)
        | KeyledgerError::Resolution(ResolutionError::NoValidKey {
            reentry_required: true,
            ..
        }) => error_response(
            StatusCode::CONFLICT,
            "key_reentry_required",
            "the stored api key can no longer be read; please enter it again",
        ),
        KeyledgerError::Resolution(ResolutionError::NoValidKey { condition, .. }) => {
            error_response(
                StatusCode::NOT_FOUND,
                "no_valid_key",
                format!("no usable api key ({}); add or fix your key", condition.as_str()),
            )
        }
        KeyledgerError::Override(OverrideError::MissingField(field)) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_override",
            format!("override is missing a valid `{field}`"),
        ),
        KeyledgerError::Usage(UsageError::Validation(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_usage", message)
        }
        KeyledgerError::Store(err)
        | KeyledgerError::Credential(CredentialError::Store(err))
        | KeyledgerError::Override(OverrideError::Store(err))
        | KeyledgerError::Resolution(ResolutionError::Store(err))
        | KeyledgerError::Usage(UsageError::Store(err)) => store_error_response(&err),
        other => {
            tracing::error!("request failed: {other}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn current_user(
    state: &KeyledgerHttpState,
    headers: &HeaderMap,
) -> Result<CurrentUser, HttpError> {
    let token = extract_bearer(headers);
    state
        .identity
        .current_user(token.as_deref())
        .await
        .map_err(|err| map_error(err.into()))
}

async fn ensure_admin(
    state: &KeyledgerHttpState,
    headers: &HeaderMap,
) -> Result<AdminGrant, HttpError> {
    let user = current_user(state, headers).await?;
    state
        .authorizer
        .require_admin(&user)
        .map_err(|err| map_error(err.into()))
}
