use axum::{Extension, Json, extract::State};

use securechat_moderation::security_tips;
use securechat_types::api::{AnalyzeRequest, AnalyzeResponse, Claims};

use crate::error::ApiError;
use crate::state::AppState;

/// Dry-run the classifier without sending anything. Lets clients preview
/// the verdict a draft would get.
pub async fn analyze(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("content must not be empty"));
    }

    let analysis = state.classifier.classify(content).await;
    let security_tips = security_tips(&analysis);

    Ok(Json(AnalyzeResponse {
        analysis,
        security_tips,
    }))
}
