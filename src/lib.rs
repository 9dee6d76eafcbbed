// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;

// Hub core
pub mod connection_manager;
pub mod dispatch;
pub mod hub;
pub mod membership;
pub mod presence;
pub mod ratelimit;
pub mod rooms;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod tasks;
