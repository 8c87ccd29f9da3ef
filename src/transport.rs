/*!
 # Transport abstraction

 The session talks to the radio through these two traits so it can run
 against btleplug in production and against an in-memory double in tests.
*/

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::Result;

/// Receives the raw bytes of every notification on a subscribed characteristic
pub type NotificationHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked once when the link reports that the peer went away
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Opens links to peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connected handle produced by this transport
    type Link: Link;

    /// Connects to the peer identified by `peer` (an address or platform id).
    ///
    /// `on_disconnect` must be called when the link drops on its own. The
    /// caller bounds this with its own timeout.
    async fn connect(&self, peer: &str, on_disconnect: DisconnectHandler) -> Result<Self::Link>;
}

/// A live connection to one peer
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Whether the underlying connection is still up
    async fn is_connected(&self) -> bool;

    /// Writes `data` to a characteristic, acknowledged or fire-and-forget
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Subscribes `handler` to notifications from a characteristic
    async fn subscribe(&self, characteristic: Uuid, handler: NotificationHandler) -> Result<()>;

    /// Declared properties of a characteristic within a service
    async fn properties(&self, service: Uuid, characteristic: Uuid) -> Result<CharPropFlags>;

    /// Closes the connection
    async fn disconnect(&self) -> Result<()>;
}
