/*!
 # Periodic status refresh

 Drives [`DeviceSession::refresh`] on a fixed interval and on demand,
 reporting failures as [`Error::UpdateFailed`].
*/

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::device::DeviceSession;
use crate::transport::Transport;
use crate::{Error, Result};

/// Refreshes one session periodically and on request
pub struct RefreshCoordinator<T: Transport> {
    session: Arc<DeviceSession<T>>,
    period: Duration,
    last_error: Arc<Mutex<Option<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

async fn refresh_once<T: Transport>(
    session: &DeviceSession<T>,
    last_error: &Mutex<Option<String>>,
) -> Result<()> {
    match session.refresh().await {
        Ok(()) => {
            *last_error.lock() = None;
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            *last_error.lock() = Some(message.clone());
            Err(Error::UpdateFailed(message))
        }
    }
}

impl<T: Transport> RefreshCoordinator<T> {
    /// Creates an idle coordinator refreshing at the session's configured interval
    pub fn new(session: Arc<DeviceSession<T>>) -> Self {
        Self {
            period: session.config().refresh_interval,
            session,
            last_error: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Overrides the refresh interval for the next [`start`](Self::start)
    pub fn with_interval(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// The refreshed session
    pub fn session(&self) -> &Arc<DeviceSession<T>> {
        &self.session
    }

    /// Message of the last failed refresh, cleared by the next successful one
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether the most recent refresh succeeded
    pub fn last_update_success(&self) -> bool {
        self.last_error.lock().is_none()
    }

    /// Refreshes right away
    #[instrument(skip(self))]
    pub async fn refresh_now(&self) -> Result<()> {
        refresh_once(&self.session, &self.last_error).await
    }

    /// Initial refresh; the device is not usable if this fails
    #[instrument(skip(self))]
    pub async fn first_refresh(&self) -> Result<()> {
        self.refresh_now().await?;
        info!("Initial status refresh done");
        Ok(())
    }

    /// Starts the background loop. Restarts it if running.
    pub fn start(&self) {
        let session = self.session.clone();
        let last_error = self.last_error.clone();
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!("Periodic status refresh");
                if let Err(e) = refresh_once(&session, &last_error).await {
                    warn!("{}", e);
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        debug!("Refresh loop started every {:?}", period);
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the loop and disconnects the session
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.session.stop().await;
    }
}

impl<T: Transport> Drop for RefreshCoordinator<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
