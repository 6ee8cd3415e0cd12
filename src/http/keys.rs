#[derive(Debug, Deserialize)]
struct SetKeyRequest {
    api_key: String,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

async fn handle_key_status(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<CredentialStatus>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let status = state
        .service
        .key_status(&user.id)
        .await
        .map_err(map_error)?;
    Ok(Json(status))
}

async fn handle_set_key(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Json(request): Json<SetKeyRequest>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let status = state
        .service
        .set_key(&user.id, &request.api_key, request.expires_at_ms)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": status,
    })))
}

async fn handle_remove_key(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let removed = state
        .service
        .remove_key(&user.id)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "removed": removed,
    })))
}

async fn handle_key_failure(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Json(failure): Json<KeyFailure>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let updated = state
        .service
        .report_key_failure(&user.id, failure)
        .await
        .map_err(map_error)?;
    if !updated {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "no api key configured",
        ));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}
