mod settings;

pub use settings::{
    ApiConfig, DispatchConfig, JwtConfig, MembershipConfig, PresenceConfig, RedisConfig,
    ServerConfig, Settings, WebSocketConfig,
};
