// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed messages exchanged between plugs.
//!
//! A [`Message`] is a small tagged value: binary states, triggers, rocker
//! positions, levels with optional move durations, temperatures, and a couple
//! of raw sensor quantities. [`convert`] maps a message into the type a
//! subscriber expects, following a fixed table; pairs outside the table fail
//! and the subscriber is simply not resumed for that publish.
//!
//! The [`text`] module maps messages to and from the short payload strings
//! carried over MQTT-SN.

#![cfg_attr(target_os = "none", no_std)]

mod convert;
pub mod text;

pub use convert::convert;

/// Message type tag, used to describe plugs and subscriptions.
///
/// The `2` variants are the inverted interpretations: `OnOff2` swaps on and
/// off, `Trigger2` treats the other rocker end as the trigger, `UpDown2`
/// swaps up and down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Unknown,
    /// 0: off, 1: on, 2: toggle
    OnOff,
    OnOff2,
    /// 0: inactive, 1: active
    Trigger,
    Trigger2,
    /// 0: inactive, 1: up, 2: down
    UpDown,
    UpDown2,
    /// level in [0.0, 1.0], flag marks a relative change
    Level,
    /// level plus move duration (seconds) or rate (1/s, flag set)
    MoveToLevel,
    Celsius,
    Fahrenheit,
    /// air pressure in hectopascal
    AirPressure,
    /// VOC sensor resistance in ohm
    Resistance,
}

/// A float with its lowest mantissa bit stolen for a boolean, used to mark
/// relative levels and move rates. All reads mask the flag bit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FloatWithFlag(u32);

impl FloatWithFlag {
    pub fn new(value: f32, flag: bool) -> Self {
        Self(value.to_bits() & !1 | flag as u32)
    }

    pub fn value(self) -> f32 {
        f32::from_bits(self.0 & !1)
    }

    pub fn flag(self) -> bool {
        self.0 & 1 != 0
    }
}

impl From<f32> for FloatWithFlag {
    fn from(value: f32) -> Self {
        Self::new(value, false)
    }
}

/// One message: the tag picks the interpretation of the payload.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Message {
    OnOff(u8),
    OnOff2(u8),
    Trigger(u8),
    Trigger2(u8),
    UpDown(u8),
    UpDown2(u8),
    Level(FloatWithFlag),
    MoveToLevel {
        level: FloatWithFlag,
        /// move duration in seconds, or rate in 1/s when the flag is set
        mov: FloatWithFlag,
    },
    Celsius(FloatWithFlag),
    Fahrenheit(FloatWithFlag),
    AirPressure(f32),
    Resistance(f32),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::OnOff(_) => MessageType::OnOff,
            Message::OnOff2(_) => MessageType::OnOff2,
            Message::Trigger(_) => MessageType::Trigger,
            Message::Trigger2(_) => MessageType::Trigger2,
            Message::UpDown(_) => MessageType::UpDown,
            Message::UpDown2(_) => MessageType::UpDown2,
            Message::Level(_) => MessageType::Level,
            Message::MoveToLevel { .. } => MessageType::MoveToLevel,
            Message::Celsius(_) => MessageType::Celsius,
            Message::Fahrenheit(_) => MessageType::Fahrenheit,
            Message::AirPressure(_) => MessageType::AirPressure,
            Message::Resistance(_) => MessageType::Resistance,
        }
    }

    /// The raw u8 command of the binary-ish variants.
    pub fn command(&self) -> Option<u8> {
        match *self {
            Message::OnOff(v)
            | Message::OnOff2(v)
            | Message::Trigger(v)
            | Message::Trigger2(v)
            | Message::UpDown(v)
            | Message::UpDown2(v) => Some(v),
            _ => None,
        }
    }
}

/// Inverts an on/off or up/down command: 0 and 1 (or 1 and 2) swap, the
/// remaining value stays.
pub(crate) fn invert_on_off(v: u8) -> u8 {
    v ^ 1 ^ (v >> 1)
}

pub(crate) fn swap_up_down(v: u8) -> u8 {
    (v << 1 | v >> 1) & 3
}
