//! `/health` endpoint with a status code adjustable at runtime

use std::sync::atomic::{AtomicI32, Ordering};

use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, info};

use super::{status_code, AppState};

#[derive(Debug)]
pub struct Health {
    code: AtomicI32,
}

impl Health {
    pub fn new(code: i32) -> Self {
        Self {
            code: AtomicI32::new(code),
        }
    }

    pub fn status_code(&self) -> i32 {
        self.code.load(Ordering::Relaxed)
    }

    pub fn set_status_code(&self, code: i32) {
        info!(code, "Updating health check response code");
        self.code.store(code, Ordering::Relaxed);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new(200)
    }
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let code = state.health.status_code();
    debug!(code, "Handling health request");
    (status_code(code), "OK")
}
