// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    invert_on_off, swap_up_down, FloatWithFlag, Message, MessageType,
};

/// Converts `src` into a message of type `dst`. Returns `None` for pairs
/// outside the conversion table; the caller then skips the subscriber.
pub fn convert(dst: MessageType, src: &Message) -> Option<Message> {
    use Message as M;
    use MessageType as T;

    Some(match (dst, *src) {
        (T::OnOff, M::OnOff(v)) => M::OnOff(v),
        (T::OnOff, M::OnOff2(v)) => M::OnOff(invert_on_off(v)),
        // a trigger (button) toggles on/off
        (T::OnOff, M::Trigger(v)) => {
            if v == 0 {
                return None;
            }
            M::OnOff(2)
        }
        // up switches off, down switches on
        (T::OnOff, M::UpDown(v)) => {
            if v == 0 {
                return None;
            }
            M::OnOff(v - 1)
        }

        (T::OnOff2, M::OnOff(v)) => M::OnOff2(invert_on_off(v)),
        (T::OnOff2, M::OnOff2(v)) => M::OnOff2(v),
        // trigger state becomes the switch state
        (T::OnOff2, M::Trigger(v)) => M::OnOff2(v),
        // up switches on, down switches off
        (T::OnOff2, M::UpDown(v)) => {
            if v == 0 {
                return None;
            }
            M::OnOff2(2 - v)
        }

        (T::Trigger, M::Trigger(v)) => M::Trigger(v),
        // up acts as press
        (T::Trigger, M::UpDown(v)) => {
            if v == 2 {
                return None;
            }
            M::Trigger(v)
        }
        (T::Trigger2, M::Trigger(v)) => M::Trigger2(v),
        (T::Trigger2, M::Trigger2(v)) => M::Trigger2(v),
        // down acts as press
        (T::Trigger2, M::UpDown(v)) => {
            if v == 1 {
                return None;
            }
            M::Trigger2(v >> 1)
        }

        // press acts as up
        (T::UpDown, M::Trigger(v)) => M::UpDown(v),
        (T::UpDown, M::UpDown(v)) => M::UpDown(v),
        // press acts as down
        (T::UpDown2, M::Trigger(v)) => M::UpDown2(v << 1),
        (T::UpDown2, M::UpDown(v)) => M::UpDown2(swap_up_down(v)),
        (T::UpDown2, M::UpDown2(v)) => M::UpDown2(v),

        (T::Level, M::Level(v)) => M::Level(v),
        (T::Level, M::MoveToLevel { level, .. }) => M::Level(level),
        (T::MoveToLevel, M::MoveToLevel { level, mov }) => {
            M::MoveToLevel { level, mov }
        }
        (T::MoveToLevel, M::Level(level)) => M::MoveToLevel {
            level,
            mov: FloatWithFlag::new(0.0, false),
        },

        (T::Celsius, M::Celsius(v)) => M::Celsius(v),
        (T::Celsius, M::Fahrenheit(v)) => M::Celsius(FloatWithFlag::new(
            (v.value() - 32.0) * 5.0 / 9.0,
            v.flag(),
        )),
        (T::Fahrenheit, M::Fahrenheit(v)) => M::Fahrenheit(v),
        (T::Fahrenheit, M::Celsius(v)) => M::Fahrenheit(FloatWithFlag::new(
            v.value() * 9.0 / 5.0 + 32.0,
            v.flag(),
        )),

        (T::AirPressure, M::AirPressure(v)) => M::AirPressure(v),
        (T::Resistance, M::Resistance(v)) => M::Resistance(v),

        _ => return None,
    })
}
