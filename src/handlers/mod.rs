mod completion;
mod health;
mod metrics;

pub use completion::completion_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
