use std::sync::Arc;

use crate::rate_limit::RateLimitStore;
use crate::routes::RouteStore;
use crate::upstream::Forwarder;

// app's shared state
pub struct AppState {
    pub forwarder: Forwarder,
    pub routes: Arc<dyn RouteStore>,
    pub client_limiter: Arc<dyn RateLimitStore>,
    pub model_limiter: Option<Arc<dyn RateLimitStore>>, // per model id, optional
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn limiters(&self) -> Vec<Arc<dyn RateLimitStore>> {
        let mut limiters = vec![self.client_limiter.clone()];
        limiters.extend(self.model_limiter.clone());
        limiters
    }
}
