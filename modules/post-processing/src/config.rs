use event_bus::Subscription;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use trace_context::Tracer;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid BUS_TYPE: {0}. Must be 'inmemory' or 'nats'")]
    UnknownBusType(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

/// Post-processing configuration shared by the consumer and relay processes
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub bus_type: BusType,
    pub nats_url: String,
    pub nats_credentials: Option<(String, String)>,
    pub bus_stream: String,
    pub bus_subjects: Vec<String>,
    /// Durable queue the consumer reads from
    pub inbox_queue: String,
    /// Wildcard pattern bound to `inbox_queue`
    pub inbox_binding: String,
    pub poll_interval: Duration,
    pub batch_limit: i64,
    pub tracing_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = match lookup("DATABASE_URL") {
            Some(url) => url,
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                var("DB_USER", "postgres"),
                var("DB_PASSWORD", "postgres"),
                var("DB_HOST", "localhost"),
                var("DB_PORT", "5432"),
                var("DB_NAME", "inbox_db"),
            ),
        };

        let bus_type = match var("BUS_TYPE", "nats").to_lowercase().as_str() {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => return Err(ConfigError::UnknownBusType(other.to_string())),
        };

        let nats_url = match lookup("NATS_URL") {
            Some(url) => url,
            None => format!(
                "nats://{}:{}",
                var("NATS_HOST", "localhost"),
                var("NATS_PORT", "4222")
            ),
        };

        let nats_credentials = match (lookup("NATS_USER"), lookup("NATS_PASSWORD")) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };

        let bus_subjects = var("BUS_SUBJECTS", "order.>")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let poll_secs: u64 = parse(&lookup, "POLL_INTERVAL", "10")?;
        let batch_limit: i64 = parse(&lookup, "BATCH_LIMIT", "100")?;
        if batch_limit <= 0 {
            return Err(ConfigError::Invalid {
                key: "BATCH_LIMIT",
                value: batch_limit.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let inbox_queue = var("INBOX_QUEUE", "inbox_queue");
        if inbox_queue.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "INBOX_QUEUE",
                value: inbox_queue,
                reason: "must not be empty".to_string(),
            });
        }

        Ok(Config {
            database_url,
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", "5")?,
            bus_type,
            nats_url,
            nats_credentials,
            bus_stream: var("BUS_STREAM", "ORDERS"),
            bus_subjects,
            inbox_queue,
            inbox_binding: var("INBOX_BINDING", "order.*"),
            poll_interval: Duration::from_secs(poll_secs),
            batch_limit,
            tracing_enabled: parse(&lookup, "TRACING_ENABLED", "true")?,
        })
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new(self.inbox_queue.clone(), self.inbox_binding.clone())
    }

    /// Tracer for a process of this service, honouring `TRACING_ENABLED`
    pub fn tracer(&self, service_name: &str) -> Tracer {
        if self.tracing_enabled {
            Tracer::new(service_name)
        } else {
            Tracer::disabled()
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.clone(),
        reason: e.to_string(),
    })
}
