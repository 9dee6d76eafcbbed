mod app;
mod middleware;
mod state;

pub use app::create_app;
pub use middleware::{api_key_auth, client_ip, rate_limit_middleware, ws_rate_limit_middleware};
pub use state::AppState;
