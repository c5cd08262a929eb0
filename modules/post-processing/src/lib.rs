pub mod bus;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod shutdown;

pub use config::{BusType, Config, ConfigError};
pub use handlers::build_registry;
