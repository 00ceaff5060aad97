use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::pipeline::ChatParams;

/// A handler for `POST /chat`
pub async fn chat_handler(
    State(AppStateData { pipeline, .. }): AppState,
    StructuredJson(params): StructuredJson<ChatParams>,
) -> Result<Response, Error> {
    let outcome = pipeline.handle(params).await?;
    let mut response = Json(outcome.response).into_response();
    response
        .headers_mut()
        .extend(outcome.rate_limit.to_header_map());
    Ok(response)
}
