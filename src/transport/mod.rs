//! Gateway transport layer (component C): owns the broker connection used
//! to tunnel Modbus RTU request/response frames to and from the
//! serial-to-MQTT gateway.

mod mqtt;

pub use mqtt::{MqttGateway, MqttGatewayConfig};

use async_trait::async_trait;
use std::time::Duration;

/// A transport capable of running a single Modbus read-holding-registers
/// transaction end to end: build the request, publish it, and wait for the
/// matching response.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Connects to the broker with infinite retry, cancellable by dropping
    /// the returned task or observing a shutdown signal.
    async fn connect(&self) -> crate::Result<()>;

    /// Disconnects and publishes the bridge's offline availability state.
    async fn disconnect(&self) -> crate::Result<()>;

    /// Whether the broker connection is currently established.
    async fn is_connected(&self) -> bool;

    /// Runs one read-holding-registers transaction under the transport's
    /// `command_mutex`, returning the raw register payload bytes.
    /// `settle_delay` is the pause observed after the transaction resolves
    /// (success or timeout) before the next command may be issued, letting
    /// the caller apply a longer settle time for slower register classes
    /// (energy meters) than for ordinary ones.
    async fn send_and_wait(
        &self,
        slave: u8,
        function: u8,
        address: u16,
        count: u16,
        timeout: Duration,
        settle_delay: Duration,
    ) -> crate::Result<Vec<u8>>;
}
