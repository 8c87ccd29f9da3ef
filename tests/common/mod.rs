#![allow(dead_code)]

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use hexagon_light::protocol::{self, cmd};
use hexagon_light::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Scriptable behaviour and recorded traffic of the fake light
#[derive(Default)]
pub struct MockState {
    pub peers: Vec<String>,
    pub connected: bool,
    pub disconnects: usize,
    /// Every write attempt as (frame, with_response), failed ones included
    pub attempts: Vec<(Vec<u8>, bool)>,
    /// Writes that went through
    pub writes: Vec<(Vec<u8>, bool)>,
    pub fail_connect: bool,
    pub connect_delay: Option<Duration>,
    pub fail_subscribe: bool,
    /// The peer drops the link while notifications are being set up
    pub drop_on_subscribe: bool,
    /// Every write hangs this long before completing
    pub write_delay: Option<Duration>,
    /// The property probe fails with a generic error
    pub fail_properties: bool,
    /// The write characteristic is absent from the discovered services
    pub missing_write_characteristic: bool,
    pub fail_unacked_writes: bool,
    pub fail_all_writes: bool,
    /// Whether the write characteristic advertises write-without-response
    pub write_without_response: bool,
    /// Notification sent back for every status request
    pub status_reply: Option<Vec<u8>>,
    pub notify: Option<NotificationHandler>,
    pub disconnect_hooks: Vec<DisconnectHandler>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, apply: impl FnOnce(&mut MockState)) {
        apply(&mut self.inner.lock());
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn attempts(&self) -> Vec<(Vec<u8>, bool)> {
        self.inner.lock().attempts.clone()
    }

    pub fn clear_writes(&self) {
        let mut state = self.inner.lock();
        state.attempts.clear();
        state.writes.clear();
    }

    /// Delivers a notification the way the radio would
    pub fn notify(&self, raw: Vec<u8>) {
        let handler = self.inner.lock().notify.clone();
        if let Some(handler) = handler {
            handler(raw);
        }
    }

    /// The peer drops the link on its own
    pub fn drop_link(&self) {
        let hook = {
            let mut state = self.inner.lock();
            state.connected = false;
            state.disconnect_hooks.last().cloned()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn connect(&self, peer: &str, on_disconnect: DisconnectHandler) -> Result<MockLink> {
        let delay = self.inner.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.lock();
        state.peers.push(peer.to_string());
        if state.fail_connect {
            return Err(Error::DeviceNotFound(peer.to_string()));
        }
        state.connected = true;
        state.disconnect_hooks.push(on_disconnect);
        Ok(MockLink {
            inner: self.inner.clone(),
        })
    }
}

pub struct MockLink {
    inner: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Link for MockLink {
    async fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    async fn write(&self, _characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let delay = {
            let mut state = self.inner.lock();
            state.attempts.push((data.to_vec(), with_response));
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut state = self.inner.lock();
            if state.fail_all_writes || (state.fail_unacked_writes && !with_response) {
                return Err(Error::BleError("write rejected".into()));
            }
            state.writes.push((data.to_vec(), with_response));
            if data[1] == cmd::STATUS {
                state.status_reply.clone().zip(state.notify.clone())
            } else {
                None
            }
        };
        if let Some((raw, handler)) = reply {
            handler(raw);
        }
        Ok(())
    }

    async fn subscribe(&self, _characteristic: Uuid, handler: NotificationHandler) -> Result<()> {
        let hook = {
            let mut state = self.inner.lock();
            if state.fail_subscribe {
                return Err(Error::CharacteristicNotFound("fff4".into()));
            }
            state.notify = Some(handler);
            if state.drop_on_subscribe {
                state.connected = false;
                state.disconnect_hooks.last().cloned()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    async fn properties(&self, _service: Uuid, _characteristic: Uuid) -> Result<CharPropFlags> {
        let state = self.inner.lock();
        if state.fail_properties {
            return Err(Error::BleError("services not resolved".into()));
        }
        if state.missing_write_characteristic {
            return Err(Error::CharacteristicNotFound("fff3".into()));
        }
        let mut props = CharPropFlags::WRITE;
        if state.write_without_response {
            props |= CharPropFlags::WRITE_WITHOUT_RESPONSE;
        }
        Ok(props)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}

/// Short timeouts so the "no reply" paths finish quickly
pub fn test_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(200),
        status_timeout: Duration::from_millis(50),
        refresh_interval: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

pub fn session() -> (DeviceSession<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let session = DeviceSession::with_config(transport.clone(), "AA:BB:CC:DD:EE:FF", test_config());
    (session, transport)
}

pub fn frame(command: u8, payload: &[u8]) -> Vec<u8> {
    protocol::build_command(command, payload).unwrap()
}

/// A short (0x55) status notification with a valid checksum
pub fn status_frame(on: bool, brightness_byte: u8) -> Vec<u8> {
    let mut raw = vec![0x55, 0x00, 0x01, 0x07, on as u8, brightness_byte];
    raw.push(protocol::checksum(&raw));
    raw
}
