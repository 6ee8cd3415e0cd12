#[derive(Debug, Default, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

impl UsageQuery {
    fn day_range(&self) -> Result<DayRange, HttpError> {
        Ok(DayRange {
            start: parse_bound(self.start.as_deref(), "start")?,
            end: parse_bound(self.end.as_deref(), "end")?,
        })
    }
}

fn parse_bound(raw: Option<&str>, name: &str) -> Result<Option<String>, HttpError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    parse_day(raw).map(Some).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_date",
            format!("{name} must be a YYYY-MM-DD date"),
        )
    })
}

async fn handle_log_usage(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Json(report): Json<UsageReport>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let outcome = state
        .service
        .log_usage(&user.id, report)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "duplicate": outcome == crate::types::AppendOutcome::Duplicate,
    })))
}

async fn handle_list_usage(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageEvent>>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let range = query.day_range()?;
    let events = state
        .service
        .usage(&user.id, &range)
        .await
        .map_err(map_error)?;
    Ok(Json(events))
}

async fn handle_usage_metrics(
    State(state): State<KeyledgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<UsageMetrics>, HttpError> {
    let user = current_user(&state, &headers).await?;
    let metrics = state
        .service
        .usage_metrics(&user.id)
        .await
        .map_err(map_error)?;
    Ok(Json(metrics))
}
