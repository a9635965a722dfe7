// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wall-clock alarms.
//!
//! An alarm record holds a fire time (weekday set, hour, minute) and up to
//! four messages, one per plug. A single coroutine ticks on the calendar's
//! second event and publishes every matching alarm's messages. Records live
//! in the alarm key namespace, headed like function records by their id and
//! a type tag.

use crate::{Error, Name, MAX_NAME_LENGTH};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use drv_timer::Calendar;
use message::{FloatWithFlag, Message};
use plug::{Element, Listener, ListenerList, Subscriber};
use storage::{Storage, STORAGE_ID_ALARM};

pub const MAX_ALARM_COUNT: usize = 16;
pub const MAX_ALARM_PLUGS: usize = 4;

const ALARM_RECORD_TAG: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlarmConfig {
    pub time: systime::AlarmTime,
    pub messages: heapless::Vec<Message, MAX_ALARM_PLUGS>,
}

// message serialization: one tag byte plus two little-endian words
fn message_to_bytes(m: &Message) -> [u8; 9] {
    let mut out = [0u8; 9];
    let (tag, a, b): (u8, u32, u32) = match *m {
        Message::OnOff(v) => (1, v as u32, 0),
        Message::OnOff2(v) => (2, v as u32, 0),
        Message::Trigger(v) => (3, v as u32, 0),
        Message::Trigger2(v) => (4, v as u32, 0),
        Message::UpDown(v) => (5, v as u32, 0),
        Message::UpDown2(v) => (6, v as u32, 0),
        Message::Level(l) => (7, l.value().to_bits(), l.flag() as u32),
        Message::MoveToLevel { level, mov } => (
            8,
            level.value().to_bits() | level.flag() as u32,
            mov.value().to_bits() | mov.flag() as u32,
        ),
        Message::Celsius(v) => {
            (9, v.value().to_bits(), v.flag() as u32)
        }
        Message::Fahrenheit(v) => {
            (10, v.value().to_bits(), v.flag() as u32)
        }
        Message::AirPressure(v) => (11, v.to_bits(), 0),
        Message::Resistance(v) => (12, v.to_bits(), 0),
    };
    out[0] = tag;
    out[1..5].copy_from_slice(&a.to_le_bytes());
    out[5..9].copy_from_slice(&b.to_le_bytes());
    out
}

fn message_from_bytes(data: &[u8]) -> Option<Message> {
    if data.len() < 9 {
        return None;
    }
    let a = u32::from_le_bytes(data[1..5].try_into().ok()?);
    let b = u32::from_le_bytes(data[5..9].try_into().ok()?);
    Some(match data[0] {
        1 => Message::OnOff(a as u8),
        2 => Message::OnOff2(a as u8),
        3 => Message::Trigger(a as u8),
        4 => Message::Trigger2(a as u8),
        5 => Message::UpDown(a as u8),
        6 => Message::UpDown2(a as u8),
        7 => Message::Level(FloatWithFlag::new(f32::from_bits(a), b != 0)),
        8 => Message::MoveToLevel {
            level: FloatWithFlag::new(
                f32::from_bits(a & !1),
                a & 1 != 0,
            ),
            mov: FloatWithFlag::new(f32::from_bits(b & !1), b & 1 != 0),
        },
        9 => Message::Celsius(FloatWithFlag::new(
            f32::from_bits(a),
            b != 0,
        )),
        10 => Message::Fahrenheit(FloatWithFlag::new(
            f32::from_bits(a),
            b != 0,
        )),
        11 => Message::AirPressure(f32::from_bits(a)),
        12 => Message::Resistance(f32::from_bits(a)),
        _ => return None,
    })
}

pub fn write_alarm_record(
    id: u8,
    name: &str,
    config: &AlarmConfig,
) -> heapless::Vec<u8, { storage::MAX_RECORD_SIZE }> {
    let mut out = heapless::Vec::new();
    out.push(id).ok();
    out.push(ALARM_RECORD_TAG).ok();
    let mut name_bytes = [0u8; MAX_NAME_LENGTH];
    let n = name.len().min(MAX_NAME_LENGTH);
    name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&name_bytes).ok();
    out.push(config.time.weekdays).ok();
    out.push(config.time.hours).ok();
    out.push(config.time.minutes).ok();
    out.push(config.messages.len() as u8).ok();
    for m in &config.messages {
        out.extend_from_slice(&message_to_bytes(m)).ok();
    }
    out
}

pub fn parse_alarm_record(
    data: &[u8],
) -> Option<(u8, Name, AlarmConfig)> {
    let header = 2 + MAX_NAME_LENGTH;
    if data.len() < header + 4 || data[1] != ALARM_RECORD_TAG {
        return None;
    }
    let id = data[0];
    let name_bytes = &data[2..2 + MAX_NAME_LENGTH];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(MAX_NAME_LENGTH);
    let mut name = Name::new();
    name.push_str(core::str::from_utf8(&name_bytes[..end]).ok()?)
        .ok()?;

    let time = systime::AlarmTime {
        weekdays: data[header],
        hours: data[header + 1],
        minutes: data[header + 2],
    };
    let count = data[header + 3] as usize;
    if count > MAX_ALARM_PLUGS {
        return None;
    }
    let mut messages = heapless::Vec::new();
    for i in 0..count {
        let at = header + 4 + i * 9;
        messages
            .push(message_from_bytes(data.get(at..at + 9)?)?)
            .ok()?;
    }
    Some((id, name, AlarmConfig { time, messages }))
}

struct AlarmSlot {
    id: u8,
    name: Name,
    config: AlarmConfig,
    element: Rc<Element>,
}

/// The alarm table plus its calendar tick coroutine.
pub struct Alarms<S: Storage> {
    calendar: Rc<Calendar>,
    store: RefCell<S>,
    listeners: Rc<ListenerList>,
    slots: RefCell<Vec<AlarmSlot>>,
}

impl<S: Storage> Alarms<S> {
    pub fn new(calendar: Rc<Calendar>, store: S) -> Self {
        Self {
            calendar,
            store: RefCell::new(store),
            listeners: Rc::new(ListenerList::new()),
            slots: RefCell::new(Vec::new()),
        }
    }

    pub fn load(&self) {
        let mut ids = [0u8; MAX_ALARM_COUNT];
        let count = {
            let store = self.store.borrow();
            store.read(STORAGE_ID_ALARM, &mut ids)
        };
        for &id in &ids[..count] {
            let mut record = [0u8; storage::MAX_RECORD_SIZE];
            let n = {
                let store = self.store.borrow();
                store.read(STORAGE_ID_ALARM | id as u16, &mut record)
            };
            let Some((record_id, name, config)) =
                parse_alarm_record(&record[..n])
            else {
                continue;
            };
            if record_id != id {
                continue;
            }
            self.insert(id, name, config);
        }
    }

    pub fn set(
        &self,
        id: Option<u8>,
        name: &str,
        config: AlarmConfig,
    ) -> Result<u8, Error> {
        let id = match id {
            Some(id) => {
                self.remove(id);
                id
            }
            None => self.allocate_id().ok_or(Error::OutOfMemory)?,
        };
        let record = write_alarm_record(id, name, &config);
        self.store
            .borrow_mut()
            .write(STORAGE_ID_ALARM | id as u16, &record)?;
        let mut parsed = Name::new();
        parsed.push_str(name).ok();
        self.insert(id, parsed, config);
        self.store_id_list()?;
        Ok(id)
    }

    pub fn erase(&self, id: u8) {
        self.remove(id);
        self.store
            .borrow_mut()
            .erase(STORAGE_ID_ALARM | id as u16);
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

    pub fn config(&self, id: u8) -> Option<AlarmConfig> {
        self.slots
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.config.clone())
    }

    /// Subscribes to one alarm's plugs.
    pub fn subscribe(&self, id: u8, subscriber: Subscriber) {
        let slots = self.slots.borrow();
        if let Some(slot) = slots.iter().find(|s| s.id == id) {
            slot.element.subscribers.add(subscriber);
        }
    }

    pub fn listen(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    /// Publishes an alarm's messages as if it had fired, for testing a
    /// configuration from the UI.
    pub fn test_fire(&self, id: u8) {
        let slots = self.slots.borrow();
        if let Some(slot) = slots.iter().find(|s| s.id == id) {
            fire(slot);
        }
    }

    /// The 1 Hz coroutine: fires every alarm whose time matches.
    pub async fn tick_loop(self: Rc<Self>) {
        loop {
            self.calendar.second_tick().await;
            let now = self.calendar.now();
            let slots = self.slots.borrow();
            for slot in slots.iter() {
                if slot.config.time.matches(now) {
                    fire(slot);
                }
            }
        }
    }

    fn insert(&self, id: u8, name: Name, config: AlarmConfig) {
        let element = Rc::new(Element::new(id, self.listeners.clone()));
        self.slots.borrow_mut().push(AlarmSlot {
            id,
            name,
            config,
            element,
        });
    }

    fn remove(&self, id: u8) {
        let mut slots = self.slots.borrow_mut();
        if let Some(pos) = slots.iter().position(|s| s.id == id) {
            slots.remove(pos);
        }
    }

    fn allocate_id(&self) -> Option<u8> {
        let slots = self.slots.borrow();
        if slots.len() >= MAX_ALARM_COUNT {
            return None;
        }
        (1..=u8::MAX).find(|&id| slots.iter().all(|s| s.id != id))
    }

    fn store_id_list(&self) -> Result<(), Error> {
        let ids = self.ids();
        self.store.borrow_mut().write(STORAGE_ID_ALARM, &ids)?;
        Ok(())
    }
}

fn fire(slot: &AlarmSlot) {
    for (plug_index, message) in slot.config.messages.iter().enumerate() {
        slot.element.publish(plug_index as u8, *message);
    }
}
