use event_bus::{BusResult, EventBus, InMemoryBus, NatsBus};
use std::sync::Arc;

use crate::config::{BusType, Config};

/// Create the event bus selected by `BUS_TYPE`
///
/// The in-memory bus only makes sense when producer and consumer share a
/// process; across processes use NATS.
pub async fn connect_bus(config: &Config) -> BusResult<Arc<dyn EventBus>> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::warn!("Using InMemory event bus; no events from other processes will arrive");
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
