/*!
 # MeRGBW/TG609 (Hexagon Light) Bluetooth Controller Library

 A Rust library for controlling MeRGBW/TG609 "Hexagon Light" panels over
 Bluetooth LE. Commands are written to a single GATT characteristic and the
 light reports power and brightness through notifications on another.

 ## Features

 * Power on/off control
 * RGB color control
 * Brightness adjustment
 * Named and numbered scenes with optional speed
 * Status refresh with a bounded wait for the device's reply
 * Lazy connect and transparent reconnect, state kept across reconnects
 * Change listeners

 ## Example

 ```no_run
 use hexagon_light::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let transport = BtleplugTransport::new().await?;
     let light = DeviceSession::new(transport, "AA:BB:CC:DD:EE:FF");

     // Connects on first use
     light.turn_on().await?;
     light.set_rgb(255, 0, 0).await?; // Set to red
     light.set_brightness_percent(80).await?; // 80% brightness
     light.set_scene_by_name("Space-Time", None).await?;

     light.refresh().await?;
     println!("{:?}", light.state());

     light.stop().await;
     Ok(())
 }
 ```
*/

use std::time::Duration;
use thiserror::Error;

/// Custom error types for the Hexagon Light library
#[derive(Error, Debug)]
pub enum Error {
    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// The peer reference did not match any known device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to find required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(String),

    /// BLE communication error
    #[error("BLE communication error: {0}")]
    BleError(String),

    /// A connect or write did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What timed out
        operation: &'static str,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Command frame does not fit the one-byte length field
    #[error("Command too long: {0} bytes (max 255)")]
    FrameTooLong(usize),

    /// Scene name not in the scene table
    #[error("Unknown scene name: {0:?}")]
    UnknownScene(String),

    /// A status refresh failed
    #[error("Update failed: {0}")]
    UpdateFailed(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod ble;
pub mod coordinator;
pub mod device;
pub mod light;
pub mod protocol;
pub mod scenes;
pub mod transport;

// Re-export key types
pub use ble::{BtleplugLink, BtleplugTransport};
pub use coordinator::RefreshCoordinator;
pub use device::{
    ConnectionState, DeviceSession, DeviceState, ListenerHandle, SessionConfig, NOTIFY_UUID,
    SERVICE_UUID, WRITE_UUID,
};
pub use light::{LightCommand, LightView};
pub use protocol::StatusUpdate;
pub use scenes::SCENES_TG609;
pub use transport::{DisconnectHandler, Link, NotificationHandler, Transport};
