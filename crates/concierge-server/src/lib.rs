use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use concierge_core::Engine;

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started_at_ms: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
