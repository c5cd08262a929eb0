use event_bus::{BusResult, EventBus, InMemoryBus, NatsBus};
use std::sync::Arc;

use crate::config::{BusType, Config};

/// Create the event bus selected by `BUS_TYPE`
///
/// For NATS this also makes sure the JetStream stream exists, so the
/// first publish does not fail on a fresh server.
pub async fn connect_bus(config: &Config) -> BusResult<Arc<dyn EventBus>> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Ok(Arc::new(InMemoryBus::new()))
        }
        BusType::Nats => {
            tracing::info!(url = %config.nats_url, "Connecting to NATS");
            let bus = NatsBus::connect(
                &config.nats_url,
                config.nats_credentials.clone(),
                config.bus_stream.clone(),
            )
            .await?;
            bus.ensure_stream(config.bus_subjects.clone()).await?;
            Ok(Arc::new(bus))
        }
    }
}
