/*!
 # Wire protocol for MeRGBW/TG609 lights

 Outbound commands are framed as

 ```text
 0x55 | cmd | 0xFF | len | payload.. | checksum
 ```

 where `len` is the total frame length and the checksum makes the byte sum of
 the whole frame equal `0xFF` (mod 256). Inbound status notifications use the
 same checksum rule and come in two variants, headed `0x55` and `0x56`.

 Everything in this module is pure; the session layer owns all I/O.
*/

use crate::{Error, Result};

/// Header byte of every outbound frame and of the short status variant
pub const FRAME_HEADER: u8 = 0x55;
/// Header byte of the extended status variant (16-bit brightness)
pub const EXTENDED_STATUS_HEADER: u8 = 0x56;
/// The protocol does not use sequencing; outbound frames always carry this
pub const SEQUENCE: u8 = 0xFF;
/// Header, command, sequence, length and checksum
pub const FRAME_OVERHEAD: usize = 5;
/// The length byte has to hold the full frame length
pub const MAX_FRAME_LEN: usize = 0xFF;

const MIN_STATUS_LEN: usize = 6;
const BRIGHTNESS_OFFSET: usize = 5;

/// Command codes understood by the device
pub mod cmd {
    /// Request a status notification (no payload)
    pub const STATUS: u8 = 0x00;
    /// Power, payload `0x00` (off) or `0x01` (on)
    pub const POWER: u8 = 0x01;
    /// Color as big-endian hue degrees followed by big-endian saturation (0-1000)
    pub const COLOR: u8 = 0x03;
    /// Brightness as big-endian `(percent + 5) * 10`
    pub const BRIGHTNESS: u8 = 0x05;
    /// Scene as a big-endian scene code
    pub const SCENE: u8 = 0x06;
    /// Scene speed, one byte
    pub const SCENE_SPEED: u8 = 0x0F;
}

/// Fields decoded from a status notification.
///
/// Power is always present in a valid frame, brightness only when the frame
/// carries it and it decodes into `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Power flag
    pub is_on: bool,
    /// Brightness in percent, if reported
    pub brightness_percent: Option<u8>,
}

/// Computes the trailing checksum for a frame without its last byte
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF_u8.wrapping_sub(sum)
}

/// Builds an outbound command frame.
///
/// Fails with [`Error::FrameTooLong`] when the frame would not fit the one-byte
/// length field; nothing is truncated.
pub fn build_command(cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = FRAME_OVERHEAD + payload.len();
    if length > MAX_FRAME_LEN {
        return Err(Error::FrameTooLong(length));
    }

    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&[FRAME_HEADER, cmd, SEQUENCE, length as u8]);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// Encodes a value as big-endian u16, silently masking it to 16 bits first
pub fn encode_u16_be(value: u32) -> [u8; 2] {
    ((value & 0xFFFF) as u16).to_be_bytes()
}

/// Converts an RGB color into the device's hue/saturation payload.
///
/// The value channel is dropped, the device takes brightness separately.
pub fn rgb_to_hue_sat_payload(r: u8, g: u8, b: u8) -> [u8; 4] {
    let (hue, saturation) = rgb_to_hue_sat(r, g, b);
    let hue = encode_u16_be(hue as u32);
    let saturation = encode_u16_be(saturation as u32);
    [hue[0], hue[1], saturation[0], saturation[1]]
}

/// Hue in whole degrees `[0, 360)` and saturation scaled to `[0, 1000]`
fn rgb_to_hue_sat(r: u8, g: u8, b: u8) -> (u16, u16) {
    let r = f64::from(r) / 255.0;
    let g = f64::from(g) / 255.0;
    let b = f64::from(b) / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max == min {
        return (0, 0);
    }

    let delta = max - min;
    let saturation = delta / max;

    let rc = (max - r) / delta;
    let gc = (max - g) / delta;
    let bc = (max - b) / delta;
    let sector = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    let hue = (sector / 6.0).rem_euclid(1.0);

    let hue_deg = ((hue * 360.0) as u32 % 360) as u16;
    let sat = ((saturation * 1000.0) as u32).min(1000) as u16;
    (hue_deg, sat)
}

/// Decodes a status notification.
///
/// Returns `None` for anything short, checksum-mismatched, length-mismatched
/// or carrying an unknown header. `None` means "leave the state alone", which
/// is different from an update without brightness.
pub fn parse_status(raw: &[u8]) -> Option<StatusUpdate> {
    if raw.len() < MIN_STATUS_LEN {
        return None;
    }
    let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0xFF {
        return None;
    }

    let is_on = raw[4] != 0;
    let brightness_percent = match raw[0] {
        FRAME_HEADER => {
            if usize::from(raw[3]) != raw.len() {
                return None;
            }
            if raw.len() >= BRIGHTNESS_OFFSET + 2 {
                percent_in_range(i32::from(raw[BRIGHTNESS_OFFSET]) - 5)
            } else {
                None
            }
        }
        EXTENDED_STATUS_HEADER => {
            if raw.len() >= BRIGHTNESS_OFFSET + 3 {
                let value =
                    u16::from_be_bytes([raw[BRIGHTNESS_OFFSET], raw[BRIGHTNESS_OFFSET + 1]]);
                percent_in_range(i32::from(value) / 10 - 5)
            } else {
                None
            }
        }
        _ => return None,
    };

    Some(StatusUpdate {
        is_on,
        brightness_percent,
    })
}

fn percent_in_range(value: i32) -> Option<u8> {
    (0..=100).contains(&value).then_some(value as u8)
}

/// Wire value for a brightness percentage; the input is clamped to `0..=100`
pub fn brightness_value(percent: u8) -> u16 {
    (u16::from(percent.min(100)) + 5) * 10
}
