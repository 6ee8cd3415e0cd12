async fn handle_all_users_usage(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserUsageSummary>>, HttpError> {
    let grant = ensure_admin(&state, &headers).await?;
    let summaries = state
        .service
        .all_users_usage(&grant)
        .await
        .map_err(map_error)?;
    Ok(Json(summaries))
}

async fn handle_user_usage(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UsageMetrics>, HttpError> {
    let grant = ensure_admin(&state, &headers).await?;
    let metrics = state
        .service
        .user_usage(&user_id, &grant)
        .await
        .map_err(map_error)?;
    Ok(Json(metrics))
}

async fn handle_set_override(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(config): Json<OverrideConfig>,
) -> Result<Json<AdminOverride>, HttpError> {
    let grant = ensure_admin(&state, &headers).await?;
    let value = state
        .service
        .set_override(&user_id, config, &grant)
        .await
        .map_err(map_error)?;
    Ok(Json(value))
}

async fn handle_remove_override(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let grant = ensure_admin(&state, &headers).await?;
    let removed = state
        .service
        .remove_override(&user_id, &grant)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "removed": removed,
    })))
}

async fn handle_set_limits(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(limits): Json<UsageLimits>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let grant = ensure_admin(&state, &headers).await?;
    state
        .service
        .set_usage_limits(&user_id, limits, &grant)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({ "success": true })))
}
