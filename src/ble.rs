use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::transport::{DisconnectHandler, Link, NotificationHandler, Transport};
use crate::{Error, Result};

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            error!("No Bluetooth adapters found");
            Error::NoBluetoothAdapters
        })?;
    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

fn matches_peer(peripheral: &Peripheral, peer: &str) -> bool {
    let peer = peer.to_lowercase();
    peripheral.address().to_string().to_lowercase() == peer
        || peripheral.id().to_string().to_lowercase() == peer
}

/// Scan time left inside `connect_timeout` for connecting and service discovery
pub fn resolve_budget(connect_timeout: Duration) -> Duration {
    connect_timeout * 2 / 3
}

/// Runs `on_drop` when dropped, unless disarmed first
struct ScanGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScanGuard<F> {
    fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }

    fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl<F: FnOnce()> Drop for ScanGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// [`Transport`] backed by the system Bluetooth stack through btleplug
pub struct BtleplugTransport {
    adapter: Adapter,
    /// How long to scan for a peer the adapter has not seen yet
    pub resolve_timeout: Duration,
}

impl BtleplugTransport {
    /// Opens the first Bluetooth adapter of the system
    #[instrument]
    pub async fn new() -> Result<Self> {
        info!("Initializing Bluetooth transport");
        let manager = Manager::new().await?;
        let adapter = get_central(&manager).await?;
        Ok(Self {
            adapter,
            resolve_timeout: resolve_budget(Duration::from_secs(15)),
        })
    }

    async fn known_peripheral(&self, peer: &str) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| matches_peer(p, peer)))
    }

    /// Caps the peer scan so it ends before a session's `connect_timeout` does
    pub fn bounded_by(mut self, connect_timeout: Duration) -> Self {
        self.resolve_timeout = resolve_budget(connect_timeout);
        self
    }

    async fn poll_known(&self, peer: &str) -> Result<Peripheral> {
        loop {
            if let Some(peripheral) = self.known_peripheral(peer).await? {
                return Ok(peripheral);
            }
            time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Finds the peripheral for `peer`, scanning briefly if the adapter has no record of it
    #[instrument(skip(self))]
    async fn resolve(&self, peer: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(peer).await? {
            return Ok(peripheral);
        }

        debug!("Peer not cached by the adapter, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;
        // Stops the scan if this future is dropped mid-scan
        let adapter = self.adapter.clone();
        let guard = ScanGuard::new(move || {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop abandoned scan: {}", e);
                    }
                });
            }
        });

        let found = time::timeout(self.resolve_timeout, self.poll_known(peer)).await;
        guard.disarm();
        self.adapter.stop_scan().await?;

        match found {
            Ok(found) => found,
            Err(_) => {
                error!(
                    "Device {} not seen within {} seconds",
                    peer,
                    self.resolve_timeout.as_secs()
                );
                Err(Error::DeviceNotFound(peer.to_string()))
            }
        }
    }

    fn watch_disconnect(
        &self,
        peripheral: &Peripheral,
        on_disconnect: DisconnectHandler,
    ) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let id = peripheral.id();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch for disconnects: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        debug!("Peer reported disconnected");
                        on_disconnect();
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    #[instrument(skip(self, on_disconnect))]
    async fn connect(&self, peer: &str, on_disconnect: DisconnectHandler) -> Result<BtleplugLink> {
        let peripheral = self.resolve(peer).await?;

        info!("Connecting to device...");
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        debug!("Discovering services...");
        peripheral.discover_services().await?;

        let disconnect_watch = self.watch_disconnect(&peripheral, on_disconnect);
        Ok(BtleplugLink {
            peripheral,
            tasks: Mutex::new(vec![disconnect_watch]),
        })
    }
}

/// A connected btleplug peripheral
pub struct BtleplugLink {
    peripheral: Peripheral,
    /// Notification and disconnect pumps, aborted with the link
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self, service: Option<Uuid>, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && service.map_or(true, |s| c.service_uuid == s))
            .ok_or_else(|| Error::CharacteristicNotFound(uuid.to_string()))
    }
}

#[async_trait]
impl Link for BtleplugLink {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(None, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        trace!("Writing {} bytes ({:?})", data.len(), write_type);
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| Error::BleError(e.to_string()))
    }

    async fn subscribe(&self, characteristic: Uuid, handler: NotificationHandler) -> Result<()> {
        let characteristic = self.characteristic(None, characteristic)?;
        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        let uuid = characteristic.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    handler(notification.value);
                }
            }
            trace!("Notification stream ended");
        });
        self.tasks.lock().push(pump);
        Ok(())
    }

    async fn properties(&self, service: Uuid, characteristic: Uuid) -> Result<CharPropFlags> {
        Ok(self.characteristic(Some(service), characteristic)?.properties)
    }

    async fn disconnect(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn scan_ends_before_the_connect_timeout() {
        assert_eq!(resolve_budget(Duration::from_secs(15)), Duration::from_secs(10));
        for secs in [1, 5, 30] {
            let connect_timeout = Duration::from_secs(secs);
            assert!(resolve_budget(connect_timeout) < connect_timeout);
        }
    }

    #[tokio::test]
    async fn guard_fires_when_the_scan_is_cancelled() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let scan = async move {
            let _guard = ScanGuard::new(move || flag.store(true, Ordering::SeqCst));
            time::sleep(Duration::from_secs(10)).await;
        };

        assert!(time::timeout(Duration::from_millis(20), scan).await.is_err());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn disarmed_guard_does_nothing() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        ScanGuard::new(move || flag.store(true, Ordering::SeqCst)).disarm();
        assert!(!stopped.load(Ordering::SeqCst));
    }
}
