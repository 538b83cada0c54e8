pub mod health;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler, ping_handler};
pub use websocket::share_websocket_handler;
