use std::sync::Arc;

use async_trait::async_trait;

use crate::control_interface::ControlError;
use crate::util::message::DeviceRecord;

/// An open control channel to one bulb.
///
/// Only the operations the scenario engine needs are part of the trait; the
/// full command set lives on [`crate::control_interface::ControlSession`].
#[async_trait]
pub trait BulbControl: Send {
    /// Sets the color temperature. Out-of-range values are clamped.
    async fn set_color_temperature(&mut self, kelvin: u32) -> Result<(), ControlError>;

    /// Sets the brightness. Out-of-range values are clamped.
    async fn set_brightness(&mut self, percent: u8) -> Result<(), ControlError>;

    /// Releases the connection.
    async fn close(self: Box<Self>) -> Result<(), ControlError>;
}

/// Opens control channels.
///
/// The scenario engine opens one channel per convergence action and closes it
/// before returning.
#[async_trait]
pub trait BulbConnector: Send + Sync {
    /// Connects to `address`; the default control port is used when the
    /// address carries none.
    async fn connect(&self, address: &str) -> Result<Box<dyn BulbControl>, ControlError>;
}

/// Receives every record decoded by the discovery listener.
///
/// Records are delivered one at a time: the listener awaits `on_record` before
/// reading the next datagram.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn on_record(&self, record: DeviceRecord);
}

#[async_trait]
impl<T> RecordSink for Arc<T>
where
    T: RecordSink + ?Sized,
{
    async fn on_record(&self, record: DeviceRecord) {
        self.as_ref().on_record(record).await
    }
}
