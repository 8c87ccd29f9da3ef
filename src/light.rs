/*!
 # Light entity view

 Maps the session's [`DeviceState`] to the 0-255 brightness scale used by
 home-automation hosts and orchestrates a combined "turn on with ..." request.
*/

use tracing::{debug, instrument};

use crate::device::{DeviceSession, DeviceState};
use crate::scenes;
use crate::transport::Transport;
use crate::Result;

/// Scales a percentage to 0-255
pub fn percent_to_level(percent: u8) -> u8 {
    (f64::from(percent.min(100)) / 100.0 * 255.0).round() as u8
}

/// Scales a 0-255 level to a percentage
pub fn level_to_percent(level: u8) -> u8 {
    (f64::from(level) / 255.0 * 100.0).round() as u8
}

/// What a host should display for the light
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightView {
    /// Power; falls back to "brightness above zero" while unknown
    pub is_on: bool,
    /// Brightness on the 0-255 scale
    pub brightness: Option<u8>,
    /// Last color
    pub rgb: Option<(u8, u8, u8)>,
    /// Active scene, only when it is a listed effect
    pub effect: Option<String>,
}

impl LightView {
    /// Builds the view from a state snapshot
    pub fn from_state(state: &DeviceState) -> Self {
        let brightness = state.brightness_percent.map(percent_to_level);
        let is_on = state
            .is_on
            .unwrap_or_else(|| brightness.is_some_and(|level| level > 0));
        let effect = state
            .effect
            .clone()
            .filter(|effect| scenes::is_listed(effect));
        Self {
            is_on,
            brightness,
            rgb: state.rgb,
            effect,
        }
    }
}

/// A combined turn-on request; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightCommand {
    /// Brightness on the 0-255 scale
    pub brightness: Option<u8>,
    /// Static color
    pub rgb: Option<(u8, u8, u8)>,
    /// Scene name, takes precedence over `rgb`
    pub effect: Option<String>,
}

/// Powers the light on and applies the scene or color, then the brightness.
///
/// Without an explicit brightness the current one is kept, or full
/// brightness when it is unknown or zero.
#[instrument(skip(session))]
pub async fn turn_on<T: Transport>(
    session: &DeviceSession<T>,
    command: &LightCommand,
) -> Result<()> {
    let current = LightView::from_state(&session.state());
    let level = command
        .brightness
        .or(current.brightness.filter(|level| *level > 0))
        .unwrap_or(255);
    let percent = level_to_percent(level);

    session.turn_on().await?;

    if let Some(effect) = &command.effect {
        debug!("Turning on with scene {}", effect);
        session.set_scene_by_name(effect, None).await?;
        session.set_brightness_percent(percent).await?;
    } else if let Some((red, green, blue)) = command.rgb {
        debug!("Turning on with color");
        session.set_rgb(red, green, blue).await?;
        session.set_brightness_percent(percent).await?;
    } else if command.brightness.is_some() {
        session.set_brightness_percent(percent).await?;
    }
    Ok(())
}
