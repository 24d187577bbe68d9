mod settings;

pub use settings::{
    ApiConfig, DatabaseConfig, NotificationConfig, RedisConfig, ServerConfig, Settings,
};
