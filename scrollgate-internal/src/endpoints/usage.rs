use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::clock::is_valid_month;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::usage_limit::UsageSummary;

/// A handler for `GET /usage/{user_id}`
pub async fn usage_summary_handler(
    State(AppStateData { ledger, .. }): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<UsageSummary>, Error> {
    Ok(Json(ledger.usage_summary(&user_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetUsageParams {
    /// `YYYY-MM`; the current month when absent
    #[serde(default)]
    pub month: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetUsageResponse {
    pub month: String,
    pub records_reset: u64,
}

/// A handler for `POST /admin/usage/reset`, driven by the monthly scheduler
pub async fn reset_usage_handler(
    State(AppStateData { ledger, clock, .. }): AppState,
    StructuredJson(params): StructuredJson<ResetUsageParams>,
) -> Result<Json<ResetUsageResponse>, Error> {
    let month = match params.month {
        Some(month) if is_valid_month(&month) => month,
        Some(month) => {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("`month` must be formatted as YYYY-MM, got `{month}`"),
            }));
        }
        None => clock.current_month(),
    };
    let records_reset = ledger.reset_for_month(&month).await?;
    Ok(Json(ResetUsageResponse {
        month,
        records_reset,
    }))
}
