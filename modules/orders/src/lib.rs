pub mod bus;
pub mod config;
pub mod db;
pub mod domain;
pub mod repository;
pub mod routes;
pub mod shutdown;

pub use config::{BusType, Config, ConfigError};
pub use domain::{CreateOrderRequest, NewOrder, Order};
pub use repository::{OrderError, OrderRepository};
pub use routes::{router, AppState};
