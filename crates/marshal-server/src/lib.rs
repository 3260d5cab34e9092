use std::sync::Arc;
use std::time::Instant;

use marshal_core::TaskRegistry;

mod http;

pub use http::{router, serve};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}
