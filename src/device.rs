use btleplug::api::CharPropFlags;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::protocol::{self, cmd};
use crate::scenes;
use crate::transport::{DisconnectHandler, Link, NotificationHandler, Transport};
use crate::{Error, Result};

/// GATT service exposing the light's characteristics
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Characteristic commands are written to
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);
/// Characteristic status frames are notified on
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

/// Connection and timing configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// UUID of the light's GATT service
    pub service_uuid: Uuid,
    /// UUID for write characteristic
    pub write_uuid: Uuid,
    /// UUID for notify characteristic
    pub notify_uuid: Uuid,
    /// Upper bound for establishing a connection
    pub connect_timeout: Duration,
    /// Upper bound for a single characteristic write
    pub write_timeout: Duration,
    /// How long a refresh waits for the status notification
    pub status_timeout: Duration,
    /// Period of the background refresh loop
    pub refresh_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            write_uuid: WRITE_UUID,
            notify_uuid: NOTIFY_UUID,
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            status_timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Last known state of the light. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Current power state
    pub is_on: Option<bool>,
    /// Current brightness (0-100)
    pub brightness_percent: Option<u8>,
    /// Last color set through this session
    pub rgb: Option<(u8, u8, u8)>,
    /// Normalized name of the active scene, if it was selected by name
    pub effect: Option<String>,
}

/// Where the session is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live link; the next operation connects
    Disconnected,
    /// Connect, subscribe and probe are in progress
    Connecting,
    /// Link is up and the write mode has been probed
    Connected,
}

/// Callback fired after every committed state change
pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Returned by [`DeviceSession::register_listener`].
///
/// Call [`ListenerHandle::unregister`] to remove the listener.
#[must_use = "dropping the handle keeps the listener registered forever"]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Mutex<Listeners>>,
}

impl ListenerHandle {
    /// Removes the listener; a no-op if the session is already gone
    pub fn unregister(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Debug)]
struct Phase {
    state: ConnectionState,
    /// Bumped on every connect attempt so stale disconnect hooks are ignored
    generation: u64,
}

/// State shared between the session and the transport's callbacks
struct Shared {
    state: Mutex<DeviceState>,
    listeners: Arc<Mutex<Listeners>>,
    phase: Mutex<Phase>,
    /// Last raw notification; every send wakes a pending refresh
    last_notify: watch::Sender<Option<Vec<u8>>>,
}

impl Shared {
    fn new() -> Self {
        let (last_notify, _) = watch::channel(None);
        Self {
            state: Mutex::new(DeviceState::default()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            phase: Mutex::new(Phase {
                state: ConnectionState::Disconnected,
                generation: 0,
            }),
            last_notify,
        }
    }

    /// The only path that mutates [`DeviceState`]. Listeners run after the lock is released.
    fn update(&self, apply: impl FnOnce(&mut DeviceState)) {
        {
            let mut state = self.state.lock();
            apply(&mut state);
            trace!(state = ?*state, "State updated");
        }
        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                warn!("State listener panicked, continuing with the others");
            }
        }
    }

    fn handle_notification(&self, raw: Vec<u8>) {
        trace!("Notification: {:02x?}", raw);
        match protocol::parse_status(&raw) {
            Some(status) => self.update(|state| {
                state.is_on = Some(status.is_on);
                if let Some(percent) = status.brightness_percent {
                    state.brightness_percent = Some(percent);
                }
            }),
            None => trace!("Discarding undecodable status frame"),
        }
        // Signalled after the merge so a woken refresh already sees the new state
        self.last_notify.send_replace(Some(raw));
    }

    fn begin_connect(&self) -> u64 {
        let mut phase = self.phase.lock();
        phase.generation += 1;
        phase.state = ConnectionState::Connecting;
        phase.generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut phase = self.phase.lock();
        if phase.generation == generation {
            phase.state = state;
        }
    }

    /// Moves `Connecting -> Connected`; false if a disconnect got there first
    fn finish_connect(&self, generation: u64) -> bool {
        let mut phase = self.phase.lock();
        if phase.generation == generation && phase.state == ConnectionState::Connecting {
            phase.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let phase = self.phase.lock();
        phase.generation == generation && phase.state == ConnectionState::Connected
    }
}

struct Connection<L> {
    link: Arc<L>,
    generation: u64,
    /// Cached until the next reconnect; only ever upgraded to `true`
    write_with_response: bool,
}

/// A session with one MeRGBW/TG609 light.
///
/// Connects lazily on the first operation and again after the link drops.
/// Device state survives reconnects.
pub struct DeviceSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    peer: Mutex<String>,
    name: String,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Option<Connection<T::Link>>>,
}

impl<T: Transport> DeviceSession<T> {
    /// Creates a session for `peer` with the default configuration. Nothing is connected yet.
    pub fn new(transport: T, peer: impl Into<String>) -> Self {
        Self::with_config(transport, peer, SessionConfig::default())
    }

    /// Creates a session with a custom configuration
    pub fn with_config(transport: T, peer: impl Into<String>, config: SessionConfig) -> Self {
        let peer = peer.into();
        Self {
            transport,
            config,
            name: peer.clone(),
            peer: Mutex::new(peer),
            shared: Arc::new(Shared::new()),
            link: tokio::sync::Mutex::new(None),
        }
    }

    /// Sets a human readable name, defaults to the address
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Peer reference used for the next connect
    pub fn address(&self) -> String {
        self.peer.lock().clone()
    }

    /// Human readable name of the light
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replaces the peer reference; takes effect on the next connect
    pub fn set_peer(&self, peer: impl Into<String>) {
        *self.peer.lock() = peer.into();
    }

    /// Snapshot of the last known device state
    pub fn state(&self) -> DeviceState {
        self.shared.state.lock().clone()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.phase.lock().state
    }

    /// Last raw status notification received, if any
    pub fn last_notification(&self) -> Option<Vec<u8>> {
        self.shared.last_notify.borrow().clone()
    }

    /// Registers a callback fired after every state change.
    ///
    /// A panicking listener is logged and does not keep the others from running.
    pub fn register_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerHandle {
        let listener: Listener = Arc::new(listener);
        let mut registry = self.shared.listeners.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, listener));
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.shared.listeners),
        }
    }

    /// Returns the live link, connecting first if there is none
    async fn ensure_connected(&self) -> Result<(Arc<T::Link>, bool)> {
        let mut slot = self.link.lock().await;
        if let Some(conn) = slot.as_ref() {
            if self.shared.is_current(conn.generation) && conn.link.is_connected().await {
                return Ok((conn.link.clone(), conn.write_with_response));
            }
            debug!("Link is gone, reconnecting");
        }
        *slot = None;

        let conn = self.connect().await?;
        let live = (conn.link.clone(), conn.write_with_response);
        *slot = Some(conn);
        Ok(live)
    }

    #[instrument(skip(self), fields(peer = %self.address()))]
    async fn connect(&self) -> Result<Connection<T::Link>> {
        let generation = self.shared.begin_connect();
        info!("Connecting to device...");

        let weak = Arc::downgrade(&self.shared);
        let on_disconnect: DisconnectHandler = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                debug!("Device disconnected");
                shared.set_state(generation, ConnectionState::Disconnected);
            }
        });

        let peer = self.address();
        let link = match time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&peer, on_disconnect),
        )
        .await
        {
            Ok(Ok(link)) => Arc::new(link),
            Ok(Err(e)) => {
                error!("Failed to connect: {}", e);
                self.shared.set_state(generation, ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                error!("Connect timed out after {:?}", self.config.connect_timeout);
                self.shared.set_state(generation, ConnectionState::Disconnected);
                return Err(Error::Timeout {
                    operation: "connect",
                    after: self.config.connect_timeout,
                });
            }
        };

        let weak = Arc::downgrade(&self.shared);
        let handler: NotificationHandler = Arc::new(move |raw| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_notification(raw);
            }
        });
        if let Err(e) = link.subscribe(self.config.notify_uuid, handler).await {
            warn!("Status notifications unavailable: {}", e);
        }

        let write_with_response = match link
            .properties(self.config.service_uuid, self.config.write_uuid)
            .await
        {
            Ok(props) => !props.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            Err(Error::CharacteristicNotFound(uuid)) => {
                debug!("Write characteristic {} not listed, using write with response", uuid);
                true
            }
            Err(e) => {
                debug!("Could not probe write characteristic: {}", e);
                false
            }
        };
        debug!(write_with_response, "Probed write characteristic");

        if !self.shared.finish_connect(generation) {
            warn!("Device disconnected while connecting");
            if let Err(e) = link.disconnect().await {
                debug!("Ignoring disconnect error: {}", e);
            }
            return Err(Error::BleError("device disconnected while connecting".into()));
        }
        info!("Connected");
        Ok(Connection {
            link,
            generation,
            write_with_response,
        })
    }

    async fn write_once(&self, link: &T::Link, frame: &[u8], with_response: bool) -> Result<()> {
        time::timeout(
            self.config.write_timeout,
            link.write(self.config.write_uuid, frame, with_response),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "write",
            after: self.config.write_timeout,
        })?
    }

    /// Writes a frame, retrying an unacknowledged write once with acknowledgment
    #[instrument(skip(self, frame), fields(cmd_length = frame.len()))]
    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let (link, with_response) = self.ensure_connected().await?;

        let result = match self.write_once(&link, frame, with_response).await {
            Ok(()) => Ok(()),
            Err(e) if !with_response => {
                warn!("Write without response failed ({}), retrying with response", e);
                let retry = self.write_once(&link, frame, true).await;
                if retry.is_ok() {
                    self.upgrade_write_mode(&link).await;
                }
                retry
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("Command failed permanently: {}", e);
            self.drop_link(&link).await;
        }
        result
    }

    async fn upgrade_write_mode(&self, link: &Arc<T::Link>) {
        if let Some(conn) = self.link.lock().await.as_mut() {
            if Arc::ptr_eq(&conn.link, link) {
                debug!("Using write with response from now on");
                conn.write_with_response = true;
            }
        }
    }

    async fn drop_link(&self, link: &Arc<T::Link>) {
        let taken = {
            let mut slot = self.link.lock().await;
            match slot.as_ref() {
                Some(conn) if Arc::ptr_eq(&conn.link, link) => slot.take(),
                _ => None,
            }
        };
        if let Some(conn) = taken {
            self.shared.set_state(conn.generation, ConnectionState::Disconnected);
            if let Err(e) = conn.link.disconnect().await {
                debug!("Ignoring disconnect error: {}", e);
            }
        }
    }

    async fn send(&self, command: u8, payload: &[u8]) -> Result<()> {
        let frame = protocol::build_command(command, payload)?;
        self.write_frame(&frame).await
    }

    /// Requests a status frame and waits briefly for the reply.
    ///
    /// No reply within the status timeout is not an error; the state is just stale.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        // A fresh receiver has already seen the current value
        let mut signal = self.shared.last_notify.subscribe();

        self.ensure_connected().await?;
        self.send(cmd::STATUS, &[]).await?;

        match time::timeout(self.config.status_timeout, signal.changed()).await {
            Ok(_) => trace!("Status notification received"),
            Err(_) => debug!("{}: no status notification received", self.address()),
        }
        Ok(())
    }

    /// Turns the light on
    #[instrument(skip(self))]
    pub async fn turn_on(&self) -> Result<()> {
        debug!("Turning light on");
        self.send(cmd::POWER, &[0x01]).await?;
        self.shared.update(|state| state.is_on = Some(true));
        info!("Light powered on");
        Ok(())
    }

    /// Turns the light off
    #[instrument(skip(self))]
    pub async fn turn_off(&self) -> Result<()> {
        debug!("Turning light off");
        self.send(cmd::POWER, &[0x00]).await?;
        self.shared.update(|state| state.is_on = Some(false));
        info!("Light powered off");
        Ok(())
    }

    /// Sets the brightness level
    ///
    /// # Arguments
    ///
    /// * `percent` - Brightness level (0-100), larger values are limited to 100
    #[instrument(skip(self))]
    pub async fn set_brightness_percent(&self, percent: u8) -> Result<()> {
        let limited = percent.min(100);
        if percent > 100 {
            warn!(
                "Brightness value {} out of range (0-100), limiting to 100",
                percent
            );
        }

        let value = protocol::brightness_value(limited);
        self.send(cmd::BRIGHTNESS, &protocol::encode_u16_be(u32::from(value)))
            .await?;
        self.shared.update(|state| state.brightness_percent = Some(limited));
        info!("Brightness set to {}%", limited);
        Ok(())
    }

    /// Sets the color; clears any active scene
    #[instrument(skip(self))]
    pub async fn set_rgb(&self, red: u8, green: u8, blue: u8) -> Result<()> {
        let payload = protocol::rgb_to_hue_sat_payload(red, green, blue);
        trace!("Hue/saturation payload {:02x?}", payload);
        self.send(cmd::COLOR, &payload).await?;
        self.shared.update(|state| {
            state.rgb = Some((red, green, blue));
            state.effect = None;
        });
        info!("Color set to RGB({}, {}, {})", red, green, blue);
        Ok(())
    }

    async fn write_scene(&self, code: u16, speed: Option<u8>) -> Result<()> {
        self.send(cmd::SCENE, &protocol::encode_u16_be(u32::from(code)))
            .await?;
        if let Some(speed) = speed {
            debug!("Setting scene speed to {}", speed);
            self.send(cmd::SCENE_SPEED, &[speed]).await?;
        }
        Ok(())
    }

    /// Activates a scene by its raw code. The named effect is cleared.
    #[instrument(skip(self))]
    pub async fn set_scene(&self, code: u16, speed: Option<u8>) -> Result<()> {
        self.write_scene(code, speed).await?;
        self.shared.update(|state| state.effect = None);
        info!("Scene {} activated", code);
        Ok(())
    }

    /// Activates a scene by name, see [`scenes::lookup`]
    #[instrument(skip(self))]
    pub async fn set_scene_by_name(&self, name: &str, speed: Option<u8>) -> Result<()> {
        let (key, code) = scenes::lookup(name).ok_or_else(|| {
            warn!("Unknown scene name: {:?}", name);
            Error::UnknownScene(name.to_string())
        })?;

        debug!("Scene {:?} resolved to code {}", key, code);
        self.write_scene(code, speed).await?;
        info!("Scene {} activated", key);
        self.shared.update(|state| state.effect = Some(key));
        Ok(())
    }

    /// Disconnects if connected. Errors are ignored and calling it twice is harmless.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let taken = self.link.lock().await.take();
        if let Some(conn) = taken {
            self.shared.set_state(conn.generation, ConnectionState::Disconnected);
            if let Err(e) = conn.link.disconnect().await {
                debug!("Ignoring disconnect error: {}", e);
            }
            info!("Disconnected");
        }
    }
}
