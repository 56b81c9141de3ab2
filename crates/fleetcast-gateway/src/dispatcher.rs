//! [`CommandDispatcher`] – viewer request → command bus.

use std::sync::Arc;

use fleetcast_middleware::{COMMAND_CHANNEL, FanoutBus};
use fleetcast_types::{Action, Command, DispatchError};
use tracing::info;

/// Validates control requests and publishes them toward devices.
#[derive(Clone)]
pub struct CommandDispatcher {
    bus: Arc<dyn FanoutBus>,
    channel: String,
}

impl CommandDispatcher {
    pub fn new(bus: Arc<dyn FanoutBus>) -> Self {
        Self::with_channel(bus, COMMAND_CHANNEL)
    }

    pub fn with_channel(bus: Arc<dyn FanoutBus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }

    /// Validate `action` and publish `"<ACTION>:<device_id>"`.
    ///
    /// Validation happens before anything touches the bus.  A publish failure
    /// is returned to the caller as is.
    pub async fn dispatch(&self, device_id: &str, action: &str) -> Result<Command, DispatchError> {
        let action: Action = action.parse()?;
        let command = Command::new(device_id, action)?;
        let receivers = self.bus.publish(&self.channel, &command.to_wire()).await?;
        info!(vin = command.device_id(), action = %command.action(), receivers, "command dispatched");
        Ok(command)
    }
}
