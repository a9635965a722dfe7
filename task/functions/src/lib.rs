// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The function runtime.
//!
//! A *function* is a persistent configuration record (switch, light, color
//! light, animated light, timed blind, heating controller) that owns one
//! coroutine implementing its state machine. Functions expose typed plugs:
//! inputs arrive over the function's barrier, outputs are published through
//! its element to whoever subscribed.
//!
//! Records are stored in a compact serialized form (id, type tag, 16-byte
//! name, type-specific payload) under the function key namespace; a list of
//! live ids sits at the namespace base. Replacing or erasing a record
//! cancels the function's coroutine before the storage changes.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod alarms;
pub mod machines;

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use drv_timer::{Rtc, Timer};
use exec::{Executor, TaskId};
use message::MessageType;
use plug::{
    Element, Listener, ListenerList, PlugBarrier, Subscriber,
    SubscriberTarget,
};
use storage::{Storage, STORAGE_ID_FUNCTION};

pub const MAX_FUNCTION_COUNT: usize = 64;
pub const MAX_NAME_LENGTH: usize = 16;
pub const MAX_SETTING_COUNT: usize = 4;
pub const MAX_STEP_COUNT: usize = 16;

pub type Name = heapless::String<MAX_NAME_LENGTH>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    InvalidParameter,
    OutOfMemory,
    Storage(storage::Error),
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Storage(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionType {
    Switch = 1,
    Light = 2,
    ColorLight = 3,
    AnimatedLight = 4,
    TimedBlind = 10,
    HeatingControl = 20,
}

impl FunctionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Switch,
            2 => Self::Light,
            3 => Self::ColorLight,
            4 => Self::AnimatedLight,
            10 => Self::TimedBlind,
            20 => Self::HeatingControl,
            _ => return None,
        })
    }
}

/// On/off switch with optional timeout (units of 10 ms).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SwitchConfig {
    pub timeout: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LightSetting {
    pub brightness: u8,
    /// fade to this setting, 1/10 s
    pub fade: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LightConfig {
    /// 1/100 s, zero disables
    pub timeout: u32,
    /// 1/10 s
    pub off_fade: u16,
    pub timeout_fade: u16,
    pub settings: heapless::Vec<LightSetting, MAX_SETTING_COUNT>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ColorSetting {
    pub brightness: u8,
    /// hue in 5-degree steps
    pub hue: u8,
    pub saturation: u8,
    /// 1/10 s
    pub fade: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColorLightConfig {
    pub timeout: u32,
    pub off_fade: u16,
    pub timeout_fade: u16,
    pub settings: heapless::Vec<ColorSetting, MAX_SETTING_COUNT>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnimatedLightConfig {
    pub timeout: u32,
    pub on_fade: u16,
    pub off_fade: u16,
    pub timeout_fade: u16,
    pub steps: heapless::Vec<ColorSetting, MAX_STEP_COUNT>,
}

/// Blind positioned by run time (both times in 1/100 s).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TimedBlindConfig {
    /// press shorter than this keeps the blind running after release
    pub hold_time: u16,
    pub run_time: u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HeatingControlConfig {}

#[derive(Clone, Debug, PartialEq)]
pub enum FunctionConfig {
    Switch(SwitchConfig),
    Light(LightConfig),
    ColorLight(ColorLightConfig),
    AnimatedLight(AnimatedLightConfig),
    TimedBlind(TimedBlindConfig),
    HeatingControl(HeatingControlConfig),
}

impl FunctionConfig {
    pub fn function_type(&self) -> FunctionType {
        match self {
            Self::Switch(_) => FunctionType::Switch,
            Self::Light(_) => FunctionType::Light,
            Self::ColorLight(_) => FunctionType::ColorLight,
            Self::AnimatedLight(_) => FunctionType::AnimatedLight,
            Self::TimedBlind(_) => FunctionType::TimedBlind,
            Self::HeatingControl(_) => FunctionType::HeatingControl,
        }
    }
}

/// The plug catalogue of each function type, inputs first.
pub fn plugs(t: FunctionType) -> &'static [MessageType] {
    use MessageType as M;
    match t {
        FunctionType::Switch => &[
            M::OnOff, // 0: command in
            M::OnOff, // 1: state out
        ],
        FunctionType::Light => &[
            M::OnOff,        // 0: command in
            M::OnOff,        // 1: state out
            M::MoveToLevel,  // 2: brightness out
        ],
        FunctionType::ColorLight | FunctionType::AnimatedLight => &[
            M::OnOff,        // 0: command in
            M::OnOff,        // 1: state out
            M::MoveToLevel,  // 2: brightness out
            M::MoveToLevel,  // 3: chromaticity x out
            M::MoveToLevel,  // 4: chromaticity y out
        ],
        FunctionType::TimedBlind => &[
            M::UpDown,  // 0: rocker in
            M::Trigger, // 1: button in
            M::Level,   // 2: position in
            M::OnOff,   // 3: enable close in
            M::UpDown,  // 4: motion out (stop/open/close)
            M::Level,   // 5: position out
        ],
        FunctionType::HeatingControl => &[
            M::OnOff,   // 0: on/off in
            M::OnOff,   // 1: night in
            M::OnOff,   // 2: summer in
            M::OnOff,   // 3: window in
            M::Celsius, // 4: setpoint in
            M::Celsius, // 5: measured in
            M::OnOff,   // 6: valve out
        ],
    }
}

/// Index of the first output plug; everything before it is an input.
pub fn first_output_plug(t: FunctionType) -> u8 {
    match t {
        FunctionType::Switch => 1,
        FunctionType::Light => 1,
        FunctionType::ColorLight | FunctionType::AnimatedLight => 1,
        FunctionType::TimedBlind => 4,
        FunctionType::HeatingControl => 6,
    }
}

// record serialization ---------------------------------------------------

fn push_u16(out: &mut heapless::Vec<u8, { storage::MAX_RECORD_SIZE }>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes()).ok();
}

fn push_u32(out: &mut heapless::Vec<u8, { storage::MAX_RECORD_SIZE }>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes()).ok();
}

/// Serializes a record: id, type tag, zero-padded name, payload.
pub fn write_record(
    id: u8,
    name: &str,
    config: &FunctionConfig,
) -> heapless::Vec<u8, { storage::MAX_RECORD_SIZE }> {
    let mut out = heapless::Vec::new();
    out.push(id).ok();
    out.push(config.function_type() as u8).ok();
    let mut name_bytes = [0u8; MAX_NAME_LENGTH];
    let n = name.len().min(MAX_NAME_LENGTH);
    name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&name_bytes).ok();

    match config {
        FunctionConfig::Switch(c) => push_u32(&mut out, c.timeout),
        FunctionConfig::Light(c) => {
            push_u32(&mut out, c.timeout);
            push_u16(&mut out, c.off_fade);
            push_u16(&mut out, c.timeout_fade);
            out.push(c.settings.len() as u8).ok();
            for s in &c.settings {
                out.push(s.brightness).ok();
                push_u16(&mut out, s.fade);
            }
        }
        FunctionConfig::ColorLight(c) => {
            push_u32(&mut out, c.timeout);
            push_u16(&mut out, c.off_fade);
            push_u16(&mut out, c.timeout_fade);
            out.push(c.settings.len() as u8).ok();
            for s in &c.settings {
                out.push(s.brightness).ok();
                out.push(s.hue).ok();
                out.push(s.saturation).ok();
                push_u16(&mut out, s.fade);
            }
        }
        FunctionConfig::AnimatedLight(c) => {
            push_u32(&mut out, c.timeout);
            push_u16(&mut out, c.on_fade);
            push_u16(&mut out, c.off_fade);
            push_u16(&mut out, c.timeout_fade);
            out.push(c.steps.len() as u8).ok();
            for s in &c.steps {
                out.push(s.brightness).ok();
                out.push(s.hue).ok();
                out.push(s.saturation).ok();
                push_u16(&mut out, s.fade);
            }
        }
        FunctionConfig::TimedBlind(c) => {
            push_u16(&mut out, c.hold_time);
            push_u16(&mut out, c.run_time);
        }
        FunctionConfig::HeatingControl(_) => {}
    }
    out
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let v = u16::from_le_bytes(
            self.data.get(self.pos..self.pos + 2)?.try_into().ok()?,
        );
        self.pos += 2;
        Some(v)
    }

    fn u32(&mut self) -> Option<u32> {
        let v = u32::from_le_bytes(
            self.data.get(self.pos..self.pos + 4)?.try_into().ok()?,
        );
        self.pos += 4;
        Some(v)
    }
}

/// Parses a stored record back into (id, name, config). Corrupt records
/// yield `None` and are skipped at load.
pub fn parse_record(data: &[u8]) -> Option<(u8, Name, FunctionConfig)> {
    if data.len() < 2 + MAX_NAME_LENGTH {
        return None;
    }
    let id = data[0];
    let t = FunctionType::from_u8(data[1])?;
    let name_bytes = &data[2..2 + MAX_NAME_LENGTH];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(MAX_NAME_LENGTH);
    let mut name = Name::new();
    name.push_str(core::str::from_utf8(&name_bytes[..end]).ok()?)
        .ok()?;

    let mut r = RecordReader {
        data,
        pos: 2 + MAX_NAME_LENGTH,
    };
    let config = match t {
        FunctionType::Switch => FunctionConfig::Switch(SwitchConfig {
            timeout: r.u32()?,
        }),
        FunctionType::Light => {
            let timeout = r.u32()?;
            let off_fade = r.u16()?;
            let timeout_fade = r.u16()?;
            let count = r.u8()? as usize;
            if count > MAX_SETTING_COUNT {
                return None;
            }
            let mut settings = heapless::Vec::new();
            for _ in 0..count {
                let brightness = r.u8()?;
                let fade = r.u16()?;
                settings.push(LightSetting { brightness, fade }).ok()?;
            }
            FunctionConfig::Light(LightConfig {
                timeout,
                off_fade,
                timeout_fade,
                settings,
            })
        }
        FunctionType::ColorLight => {
            let timeout = r.u32()?;
            let off_fade = r.u16()?;
            let timeout_fade = r.u16()?;
            let count = r.u8()? as usize;
            if count > MAX_SETTING_COUNT {
                return None;
            }
            let mut settings = heapless::Vec::new();
            for _ in 0..count {
                settings
                    .push(ColorSetting {
                        brightness: r.u8()?,
                        hue: r.u8()?,
                        saturation: r.u8()?,
                        fade: r.u16()?,
                    })
                    .ok()?;
            }
            FunctionConfig::ColorLight(ColorLightConfig {
                timeout,
                off_fade,
                timeout_fade,
                settings,
            })
        }
        FunctionType::AnimatedLight => {
            let timeout = r.u32()?;
            let on_fade = r.u16()?;
            let off_fade = r.u16()?;
            let timeout_fade = r.u16()?;
            let count = r.u8()? as usize;
            if count > MAX_STEP_COUNT {
                return None;
            }
            let mut steps = heapless::Vec::new();
            for _ in 0..count {
                steps
                    .push(ColorSetting {
                        brightness: r.u8()?,
                        hue: r.u8()?,
                        saturation: r.u8()?,
                        fade: r.u16()?,
                    })
                    .ok()?;
            }
            FunctionConfig::AnimatedLight(AnimatedLightConfig {
                timeout,
                on_fade,
                off_fade,
                timeout_fade,
                steps,
            })
        }
        FunctionType::TimedBlind => {
            FunctionConfig::TimedBlind(TimedBlindConfig {
                hold_time: r.u16()?,
                run_time: r.u16()?,
            })
        }
        FunctionType::HeatingControl => {
            FunctionConfig::HeatingControl(HeatingControlConfig {})
        }
    };
    Some((id, name, config))
}

// runtime ----------------------------------------------------------------

/// Everything a function coroutine talks to.
pub struct FunctionIo<R: Rtc> {
    pub element: Rc<Element>,
    pub barrier: Rc<PlugBarrier>,
    pub timer: Rc<Timer<R>>,
}

impl<R: Rtc> Clone for FunctionIo<R> {
    fn clone(&self) -> Self {
        Self {
            element: self.element.clone(),
            barrier: self.barrier.clone(),
            timer: self.timer.clone(),
        }
    }
}

struct FunctionSlot {
    id: u8,
    name: Name,
    config: FunctionConfig,
    element: Rc<Element>,
    barrier: Rc<PlugBarrier>,
    task: TaskId,
}

/// The function registry: loads records at boot, owns one coroutine per
/// function, and answers the interface queries (ids, names, plugs,
/// subscriber targets).
pub struct Functions<S: Storage, R: Rtc + 'static> {
    exec: Executor,
    timer: Rc<Timer<R>>,
    store: RefCell<S>,
    listeners: Rc<ListenerList>,
    slots: RefCell<Vec<FunctionSlot>>,
}

impl<S: Storage, R: Rtc> Functions<S, R> {
    pub fn new(exec: Executor, timer: Rc<Timer<R>>, store: S) -> Self {
        Self {
            exec,
            timer,
            store: RefCell::new(store),
            listeners: Rc::new(ListenerList::new()),
            slots: RefCell::new(Vec::new()),
        }
    }

    /// Loads all records and starts their coroutines. Records that fail to
    /// parse or whose id does not match their key are skipped.
    pub fn load(&self) {
        let mut ids = [0u8; MAX_FUNCTION_COUNT];
        let count = {
            let store = self.store.borrow();
            store.read(STORAGE_ID_FUNCTION, &mut ids)
        };
        for &id in &ids[..count] {
            let mut record = [0u8; storage::MAX_RECORD_SIZE];
            let n = {
                let store = self.store.borrow();
                store.read(STORAGE_ID_FUNCTION | id as u16, &mut record)
            };
            let Some((record_id, name, config)) =
                parse_record(&record[..n])
            else {
                continue;
            };
            if record_id != id {
                continue;
            }
            self.start_function(id, name, config);
        }
    }

    /// Adds or replaces a function. Replacing cancels the old coroutine
    /// before the record is overwritten.
    pub fn set(
        &self,
        id: Option<u8>,
        name: &str,
        config: FunctionConfig,
    ) -> Result<u8, Error> {
        let id = match id {
            Some(id) => {
                self.stop_function(id);
                id
            }
            None => self.allocate_id().ok_or(Error::OutOfMemory)?,
        };
        let record = write_record(id, name, &config);
        self.store
            .borrow_mut()
            .write(STORAGE_ID_FUNCTION | id as u16, &record)?;

        let mut parsed_name = Name::new();
        parsed_name.push_str(name).ok();
        self.start_function(id, parsed_name, config);
        self.store_id_list()?;
        Ok(id)
    }

    /// Destroys a function: coroutine first, then storage.
    pub fn erase(&self, id: u8) {
        self.stop_function(id);
        self.store
            .borrow_mut()
            .erase(STORAGE_ID_FUNCTION | id as u16);
        self.store_id_list().ok();
    }

    pub fn ids(&self) -> Vec<u8> {
        self.slots.borrow().iter().map(|s| s.id).collect()
    }

    pub fn name(&self, id: u8) -> Option<Name> {
        self.slots
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.name.clone())
    }

    pub fn config(&self, id: u8) -> Option<FunctionConfig> {
        self.slots
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.config.clone())
    }

    pub fn plugs_of(&self, id: u8) -> Option<&'static [MessageType]> {
        self.slots
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| plugs(s.config.function_type()))
    }

    /// Target for subscribing another element's output to one of this
    /// function's input plugs.
    pub fn subscriber_target(
        &self,
        id: u8,
        plug_index: u8,
    ) -> Option<SubscriberTarget> {
        let slots = self.slots.borrow();
        let slot = slots.iter().find(|s| s.id == id)?;
        let catalogue = plugs(slot.config.function_type());
        let message_type = *catalogue.get(plug_index as usize)?;
        if plug_index >= first_output_plug(slot.config.function_type()) {
            return None;
        }
        Some(SubscriberTarget {
            plug_index,
            message_type,
            barrier: slot.barrier.clone(),
        })
    }

    /// Subscribes to one of this function's output plugs.
    pub fn subscribe(&self, id: u8, subscriber: Subscriber) {
        let slots = self.slots.borrow();
        if let Some(slot) = slots.iter().find(|s| s.id == id) {
            slot.element.subscribers.add(subscriber);
        }
    }

    /// Listens to every message published by any function.
    pub fn listen(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    pub fn count(&self) -> usize {
        self.slots.borrow().len()
    }

    fn allocate_id(&self) -> Option<u8> {
        let slots = self.slots.borrow();
        if slots.len() >= MAX_FUNCTION_COUNT {
            return None;
        }
        (1..=u8::MAX).find(|&id| slots.iter().all(|s| s.id != id))
    }

    fn store_id_list(&self) -> Result<(), Error> {
        let ids = self.ids();
        self.store
            .borrow_mut()
            .write(STORAGE_ID_FUNCTION, &ids)?;
        Ok(())
    }

    fn stop_function(&self, id: u8) {
        let mut slots = self.slots.borrow_mut();
        if let Some(pos) = slots.iter().position(|s| s.id == id) {
            let slot = slots.remove(pos);
            // cancel before the record goes away
            self.exec.cancel(slot.task);
        }
    }

    fn start_function(&self, id: u8, name: Name, config: FunctionConfig) {
        let element = Rc::new(Element::new(id, self.listeners.clone()));
        let barrier = Rc::new(PlugBarrier::new());
        let io = FunctionIo {
            element: element.clone(),
            barrier: barrier.clone(),
            timer: self.timer.clone(),
        };
        let task = match &config {
            FunctionConfig::Switch(c) => {
                self.exec.spawn(machines::switch(*c, io))
            }
            FunctionConfig::Light(c) => {
                self.exec.spawn(machines::light(c.clone(), io))
            }
            FunctionConfig::ColorLight(c) => {
                self.exec.spawn(machines::color_light(c.clone(), io))
            }
            FunctionConfig::AnimatedLight(c) => {
                self.exec.spawn(machines::animated_light(c.clone(), io))
            }
            FunctionConfig::TimedBlind(c) => {
                self.exec.spawn(machines::timed_blind(*c, io))
            }
            FunctionConfig::HeatingControl(c) => {
                self.exec.spawn(machines::heating_control(*c, io))
            }
        };
        self.slots.borrow_mut().push(FunctionSlot {
            id,
            name,
            config,
            element,
            barrier,
            task,
        });
    }
}
