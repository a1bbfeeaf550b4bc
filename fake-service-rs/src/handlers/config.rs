//! `/config/{parameter}/{value}` live reconfiguration

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{error, info};

use super::AppState;

const ERROR_RATE_USAGE: &str = "Config endpoint error_rate expects a floating point value between 0 and 1";
const HEALTH_CODE_USAGE: &str =
    "Config endpoint health_check_response_code expects an int value representing an HTTP status code";

pub async fn config_handler(
    State(state): State<AppState>,
    Path((parameter, value)): Path<(String, String)>,
) -> impl IntoResponse {
    info!(parameter = %parameter, value = %value, "Set config");

    match parameter.as_str() {
        "error_rate" => match value.parse::<f64>() {
            Ok(rate) if (0.0..=1.0).contains(&rate) => {
                state.orchestrator.injector().set_error_percentage(rate);
                (StatusCode::OK, String::new())
            }
            _ => {
                error!(value = %value, "{}", ERROR_RATE_USAGE);
                (StatusCode::BAD_REQUEST, ERROR_RATE_USAGE.to_string())
            }
        },
        "health_check_response_code" => match value.parse::<u16>().ok().filter(|c| StatusCode::from_u16(*c).is_ok()) {
            Some(code) => {
                state.health.set_status_code(i32::from(code));
                (StatusCode::OK, String::new())
            }
            None => {
                error!(value = %value, "{}", HEALTH_CODE_USAGE);
                (StatusCode::BAD_REQUEST, HEALTH_CODE_USAGE.to_string())
            }
        },
        _ => (StatusCode::BAD_REQUEST, "Invalid parameter".to_string()),
    }
}
