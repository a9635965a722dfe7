// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The function state machines.
//!
//! Each runs as one coroutine: wait for an input message on the function's
//! barrier (racing a timeout where the state calls for one), update state,
//! publish the observable changes on the output plugs.

use crate::{
    AnimatedLightConfig, ColorLightConfig, FunctionIo, HeatingControlConfig,
    LightConfig, LightSetting, SwitchConfig, TimedBlindConfig,
};
use cie1931::hue_to_cie;
use drv_timer::Rtc;
use exec::{select2, Select2};
use message::Message;
use plug::PlugInfo;
use systime::{ms, SystemTime};

const CELSIUS_OFFSET: f32 = 273.15;

/// A binary state with set/clear/toggle commands.
#[derive(Default)]
struct OnOff {
    state: u8,
}

impl OnOff {
    /// Applies a command (0 clear, 1 set, 2 toggle); true when the state
    /// changed.
    fn apply(&mut self, command: u8) -> bool {
        match command {
            0 | 1 => {
                let changed = self.state != command;
                self.state = command;
                changed
            }
            2 => {
                self.state ^= 1;
                true
            }
            _ => false,
        }
    }

    fn on(&self) -> bool {
        self.state != 0
    }
}

fn command(msg: &Message) -> u8 {
    msg.command().unwrap_or(0)
}

pub async fn switch<R: Rtc>(config: SwitchConfig, io: FunctionIo<R>) {
    let timeout = ms(config.timeout as i32 * 10);
    let mut on = OnOff::default();
    loop {
        let message = if !on.on() || timeout == ms(0) {
            // off or no timeout: wait for the next message
            let (_, msg) = io.barrier.wait().await;
            command(&msg)
        } else {
            match select2(io.barrier.wait(), io.timer.sleep_for(timeout))
                .await
            {
                Select2::First((_, msg)) => command(&msg),
                // timeout switches off
                Select2::Second(()) => 0,
            }
        };

        if on.apply(message) {
            io.element.publish_switch(1, on.state);
        }
    }
}

pub async fn light<R: Rtc>(config: LightConfig, io: FunctionIo<R>) {
    let timeout = ms(config.timeout as i32 * 10);
    let mut on = OnOff::default();

    // fade off either by switching off or after the timeout
    let mut off_fade: u16 = config.off_fade;

    let mut setting_index: usize = 0;
    let mut have_setting = false;

    let mut transition = false;
    let mut end_time = SystemTime::default();
    let mut off_time = SystemTime::default();

    loop {
        let now;
        let mut info = PlugInfo::default();
        let message;
        let timeout_active = timeout > ms(0) && on.on();
        if !timeout_active && !transition {
            let (i, msg) = io.barrier.wait().await;
            info = i;
            message = command(&msg);
            now = io.timer.now();
            off_fade = config.off_fade;
        } else {
            // sleep until whichever comes first: off timeout or the end of
            // the running transition
            let off = timeout_active && (!transition || off_time <= end_time);
            let deadline = if off { off_time } else { end_time };
            match select2(io.barrier.wait(), io.timer.sleep(deadline)).await
            {
                Select2::First((i, msg)) => {
                    info = i;
                    message = command(&msg);
                    now = io.timer.now();
                    off_fade = config.off_fade;
                }
                Select2::Second(()) => {
                    now = io.timer.now();
                    if off {
                        message = 0;
                        off_fade = config.timeout_fade;
                    } else {
                        // end of transition, nothing to publish
                        transition = false;
                        continue;
                    }
                }
            }
        }

        let changed = on.apply(message);
        if on.on() {
            off_time = now + timeout;
        }

        // the subscription that delivered the message selects the setting
        let mut force = false;
        let count = config.settings.len().max(1);
        let new_setting = info.source_index as usize % count;
        if on.on() && (!have_setting || setting_index != new_setting) {
            setting_index = new_setting;
            have_setting = true;
        } else if !changed {
            if transition {
                // a confirming message interrupts the transition and snaps
                // to the target
                transition = false;
                force = true;
            } else {
                continue;
            }
        }
        let setting = config
            .settings
            .get(setting_index)
            .copied()
            .unwrap_or(LightSetting {
                brightness: 100,
                fade: 0,
            });

        let (brightness, mut fade) = if on.on() {
            (setting.brightness as f32 * 0.01, setting.fade)
        } else {
            (0.0, off_fade)
        };

        if !force {
            transition = fade > 0;
            end_time = now + ms(fade as i32 * 100);
        } else {
            fade = 1;
        }

        if changed {
            io.element.publish_switch(1, on.state);
        }
        io.element.publish_float_transition(2, brightness, 0, fade);
    }
}

pub async fn color_light<R: Rtc>(
    config: ColorLightConfig,
    io: FunctionIo<R>,
) {
    let timeout = ms(config.timeout as i32 * 10);
    let mut on = OnOff::default();
    let mut off_fade: u16 = config.off_fade;
    let mut setting_index: usize = 0;
    let mut have_setting = false;
    let mut transition = false;
    let mut end_time = SystemTime::default();
    let mut off_time = SystemTime::default();

    loop {
        let now;
        let mut info = PlugInfo::default();
        let message;
        let timeout_active = timeout > ms(0) && on.on();
        if !timeout_active && !transition {
            let (i, msg) = io.barrier.wait().await;
            info = i;
            message = command(&msg);
            now = io.timer.now();
            off_fade = config.off_fade;
        } else {
            let off = timeout_active && (!transition || off_time <= end_time);
            let deadline = if off { off_time } else { end_time };
            match select2(io.barrier.wait(), io.timer.sleep(deadline)).await
            {
                Select2::First((i, msg)) => {
                    info = i;
                    message = command(&msg);
                    now = io.timer.now();
                    off_fade = config.off_fade;
                }
                Select2::Second(()) => {
                    now = io.timer.now();
                    if off {
                        message = 0;
                        off_fade = config.timeout_fade;
                    } else {
                        transition = false;
                        continue;
                    }
                }
            }
        }

        let changed = on.apply(message);
        if on.on() {
            off_time = now + timeout;
        }

        let mut set_color = false;
        let mut force = false;
        let count = config.settings.len().max(1);
        let new_setting = info.source_index as usize % count;
        if on.on() && (!have_setting || setting_index != new_setting) {
            setting_index = new_setting;
            have_setting = true;
            set_color = true;
        } else if !changed {
            if transition {
                transition = false;
                force = true;
            } else {
                continue;
            }
        }
        let setting = config.settings.get(setting_index).copied();

        let mut brightness = 0.0;
        let mut brightness_fade = off_fade;
        let mut color = cie1931::Cie1931::default();
        let mut color_fade = 1;
        if on.on() {
            if let Some(setting) = setting {
                brightness = setting.brightness as f32 * 0.01;
                brightness_fade = setting.fade;
                color = hue_to_cie(
                    setting.hue as f32 * 5.0,
                    setting.saturation as f32 * 0.01,
                );
                if !transition && changed {
                    // set the color right away when switching on outside a
                    // transition; fade zero does not work on some lamps
                    color_fade = 1;
                    set_color = true;
                } else {
                    color_fade = setting.fade;
                }
            }
        }

        if !force {
            transition = brightness_fade > 0;
            end_time = now + ms(brightness_fade as i32 * 100);
        } else {
            brightness_fade = 1;
            color_fade = 1;
            set_color = on.on();
        }

        if changed {
            io.element.publish_switch(1, on.state);
        }
        io.element
            .publish_float_transition(2, brightness, 0, brightness_fade);
        if set_color {
            io.element
                .publish_float_transition(3, color.x, 0, color_fade);
            io.element
                .publish_float_transition(4, color.y, 0, color_fade);
        }
    }
}

pub async fn animated_light<R: Rtc>(
    config: AnimatedLightConfig,
    io: FunctionIo<R>,
) {
    let timeout = ms(config.timeout as i32 * 10);
    let step_count = config.steps.len().max(1);
    let mut on = OnOff::default();
    let mut off_fade: u16 = 0;

    // on/off transition
    let mut transition = false;
    let mut start_time = SystemTime::default();
    let mut end_time = SystemTime::default();

    // animation steps
    let mut step_index: usize = 0;
    let mut step_time = SystemTime::default();
    let mut next_time = SystemTime::default();

    let mut off_time = SystemTime::default();

    loop {
        let now;
        let message;
        let mut set_color = false;
        if !on.on() && !transition {
            let (_, msg) = io.barrier.wait().await;
            message = command(&msg);
            now = io.timer.now();
        } else {
            // earliest of: next animation step, transition end, off timeout
            let mut deadline = next_time;
            if transition && end_time <= deadline {
                deadline = end_time;
            }
            let off = timeout > ms(0) && on.on() && off_time <= deadline;
            if off {
                deadline = off_time;
            }
            match select2(io.barrier.wait(), io.timer.sleep(deadline)).await
            {
                Select2::First((_, msg)) => {
                    message = command(&msg);
                    off_fade = config.off_fade;
                }
                Select2::Second(()) => {
                    if off {
                        message = 0;
                        off_fade = config.timeout_fade;
                    } else {
                        // animation step or transition end: state unchanged
                        message = 3;
                    }
                }
            }
            now = io.timer.now();

            // advance to the next animation step when due
            if now >= next_time {
                step_index += 1;
                if step_index >= step_count {
                    step_index = 0;
                }
                step_time = now;
                set_color = true;
            }
            if now >= end_time {
                transition = false;
            }
        }

        let changed = on.apply(message);
        if on.on() && message < 3 {
            off_time = now + timeout;
        }

        let mut force = false;
        if changed {
            // merge the new on/off ramp with a transition in progress: the
            // partial progress scales and the endpoint is recalculated
            let fade = if on.on() {
                config.on_fade
            } else {
                off_fade
            };
            let duration = ms(fade as i32 * 100);
            if transition {
                let progress =
                    (now - start_time).ratio(end_time - start_time);
                start_time = now - duration * (1.0 - progress);
            } else {
                start_time = now;
            }
            end_time = start_time + duration;

            if on.on() {
                // off to on: restart the sequence at the current step
                step_time = now;
                set_color = true;
            }
            transition = true;
        } else if transition && message < 3 {
            // confirming message interrupts the ramp
            transition = false;
            force = true;
        } else if !set_color || (!on.on() && !transition) {
            continue;
        }

        let step = config.steps.get(step_index).copied().unwrap_or(
            crate::ColorSetting {
                brightness: 100,
                hue: 0,
                saturation: 0,
                fade: 10,
            },
        );
        let fade = step.fade.max(1);
        next_time = step_time + ms(fade as i32 * 100);
        let mut brightness = step.brightness as f32 * 0.01;
        let mut brightness_fade = fade;
        let color =
            hue_to_cie(step.hue as f32 * 5.0, step.saturation as f32 * 0.01);
        let color_fade = fade;

        if force {
            brightness_fade = 1;
            if !on.on() {
                brightness = 0.0;
            }
        } else if on.on() {
            if transition {
                if next_time >= end_time {
                    if changed {
                        brightness_fade = config.on_fade;
                    }
                } else {
                    brightness *=
                        (next_time - start_time).ratio(end_time - start_time);
                }
            }
        } else if transition {
            if next_time >= end_time {
                brightness_fade = if changed {
                    off_fade
                } else {
                    ((end_time - step_time).to_millis() / 100) as u16
                };
                brightness = 0.0;
            } else {
                brightness *= 1.0
                    - (next_time - start_time).ratio(end_time - start_time);
            }
        }

        if changed {
            io.element.publish_switch(1, on.state);
        }
        io.element
            .publish_float_transition(2, brightness, 0, brightness_fade);
        if set_color {
            io.element
                .publish_float_transition(3, color.x, 0, color_fade);
            io.element
                .publish_float_transition(4, color.y, 0, color_fade);
        }
    }
}

pub async fn timed_blind<R: Rtc>(
    config: TimedBlindConfig,
    io: FunctionIo<R>,
) {
    // 0 stopped, 1 opening, 2 closing
    let mut state: u8 = 0;
    let mut up = false;
    let mut enable_close = true;

    let hold_time = ms(config.hold_time as i32 * 10);
    let max_position = ms(config.run_time as i32 * 10);
    let mut position = max_position / 2;
    let mut target = position;
    let mut start_time = SystemTime::default();
    let mut last_time = SystemTime::default();

    loop {
        let (info, message) = if state == 0 {
            io.barrier.wait().await
        } else {
            // wait for a message or the end of travel, reporting the
            // position at least every 200 ms while moving
            let d = target - position;
            let wait = (if up { -d } else { d }).min(ms(200));
            let outcome =
                select2(io.barrier.wait(), io.timer.sleep_for(wait)).await;

            // advance the position by the travel since last look
            let now = io.timer.now();
            let travelled = now - last_time;
            last_time = now;
            if up {
                position -= travelled;
                if position <= target {
                    position = target;
                }
            } else {
                position += travelled;
                if position >= target {
                    position = target;
                }
            }

            match outcome {
                Select2::First((i, m)) => (i, m),
                Select2::Second(()) => (
                    PlugInfo {
                        plug_index: 255,
                        ..PlugInfo::default()
                    },
                    Message::OnOff(0),
                ),
            }
        };

        match info.plug_index {
            0 | 1 => {
                let value = message.command().unwrap_or(0);
                if value == 0 {
                    // released: keep running to the end unless the press
                    // was long enough to count as "hold"
                    if io.timer.now() > start_time + hold_time {
                        target = position;
                    }
                } else if state == 0 {
                    // start moving
                    target = if info.plug_index == 1 {
                        // trigger toggles direction
                        if (up || target == ms(0)) && target < max_position
                        {
                            max_position
                        } else {
                            ms(0)
                        }
                    } else if value == 1 {
                        ms(0)
                    } else {
                        max_position
                    };
                } else {
                    // press while moving stops
                    target = position;
                }
            }
            2 => {
                if let Message::Level(level) = message {
                    let p = max_position * level.value();
                    if !level.flag() {
                        target = p;
                    } else {
                        target = target + p;
                    }
                    if target < ms(0) {
                        target = ms(0);
                    }
                    if target > max_position {
                        target = max_position;
                    }
                }
            }
            3 => {
                enable_close = message.command().unwrap_or(1) != 0;
            }
            _ => {}
        }

        // downward motion can be vetoed
        if !enable_close && target > position {
            target = position;
        }

        if position == target {
            state = 0;
        } else if state == 0 {
            up = target < position;
            state = if up { 1 } else { 2 };
            start_time = io.timer.now();
            last_time = start_time;
        }

        io.element.publish_up_down(4, state);
        io.element
            .publish_float(5, position.ratio(max_position));
    }
}

pub async fn heating_control<R: Rtc>(
    _config: HeatingControlConfig,
    io: FunctionIo<R>,
) {
    let mut valve: u8 = 0;
    let mut on = OnOff::default();
    let mut night = OnOff::default();
    let mut summer = OnOff::default();
    let mut windows: u32 = 0;
    let mut set_temperature = 20.0 + CELSIUS_OFFSET;
    let mut temperature = 20.0 + CELSIUS_OFFSET;

    loop {
        let (info, message) = io.barrier.wait().await;
        match info.plug_index {
            0 => {
                on.apply(command(&message));
            }
            1 => {
                night.apply(command(&message));
            }
            2 => {
                summer.apply(command(&message));
            }
            3 => {
                // track each window by its subscription index
                if command(&message) == 0 {
                    windows &= !(1 << info.source_index);
                } else {
                    windows |= 1 << info.source_index;
                }
            }
            4 => {
                if let Message::Celsius(v) = message {
                    if v.flag() {
                        set_temperature += v.value();
                    } else {
                        set_temperature = v.value() + CELSIUS_OFFSET;
                    }
                }
            }
            5 => {
                if let Message::Celsius(v) = message {
                    temperature = v.value() + CELSIUS_OFFSET;
                }
            }
            _ => {}
        }

        // two-position control with 0.2 K hysteresis; the valve stays shut
        // when off, in summer mode, or with any window open
        if on.on() && !summer.on() && windows == 0 {
            if valve == 0 {
                if temperature < set_temperature - 0.2 {
                    valve = 1;
                }
            } else if temperature > set_temperature + 0.2 {
                valve = 0;
            }
        } else {
            valve = 0;
        }

        io.element.publish_switch(6, valve);
    }
}
