// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The plug plane: how messages travel between elements.
//!
//! An element (a function, a local device, a bus or radio endpoint) exposes
//! typed plugs. A *subscriber* connects one output plug of a source element
//! to one input plug of a target element: when the source publishes, the
//! message is converted to the target's type and the target's barrier is
//! resumed with the converted message and the target-side plug info. A
//! *listener* receives every message of an element unconverted.
//!
//! Conversion failures drop the delivery for that subscriber only.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use exec::Barrier;
use message::{convert, FloatWithFlag, Message, MessageType};

/// Delivery metadata handed to a waiting coroutine along with the message.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PlugInfo {
    /// Id of the publishing element (meaningful to listeners).
    pub element_id: u8,
    /// For subscribers: the target's input plug index. For listeners: the
    /// source's plug index.
    pub plug_index: u8,
    /// Index of the subscription at the target, e.g. to select a light
    /// setting by which wall switch fired.
    pub source_index: u8,
}

/// Barrier type every plug-connected coroutine waits on.
pub type PlugBarrier = Barrier<(PlugInfo, Message)>;

/// Where a subscription delivers: obtained from the target element.
#[derive(Clone)]
pub struct SubscriberTarget {
    pub plug_index: u8,
    pub message_type: MessageType,
    pub barrier: Rc<PlugBarrier>,
}

/// A subscription from one source plug to a target.
#[derive(Clone)]
pub struct Subscriber {
    /// Output plug of the source element this subscription taps.
    pub source_plug: u8,
    /// Index of this subscription at the target.
    pub source_index: u8,
    pub target: SubscriberTarget,
}

/// Subscriptions on one element's output plugs.
#[derive(Default)]
pub struct SubscriberList {
    subs: RefCell<Vec<Subscriber>>,
}

impl SubscriberList {
    pub const fn new() -> Self {
        Self {
            subs: RefCell::new(Vec::new()),
        }
    }

    pub fn add(&self, sub: Subscriber) {
        self.subs.borrow_mut().push(sub);
    }

    /// Removes every subscription delivering to `barrier`; used when the
    /// target element is erased.
    pub fn remove_target(&self, barrier: &Rc<PlugBarrier>) {
        self.subs
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(&s.target.barrier, barrier));
    }

    pub fn len(&self) -> usize {
        self.subs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.borrow().is_empty()
    }

    fn publish(&self, plug_index: u8, msg: &Message) {
        for sub in self.subs.borrow().iter() {
            if sub.source_plug != plug_index {
                continue;
            }
            let Some(converted) = convert(sub.target.message_type, msg) else {
                continue;
            };
            sub.target.barrier.resume_first((
                PlugInfo {
                    element_id: 0,
                    plug_index: sub.target.plug_index,
                    source_index: sub.source_index,
                },
                converted,
            ));
        }
    }
}

/// A listener taps every plug of an element.
#[derive(Clone)]
pub struct Listener {
    pub barrier: Rc<PlugBarrier>,
}

/// Listeners on a whole interface.
#[derive(Default)]
pub struct ListenerList {
    listeners: RefCell<Vec<Listener>>,
}

impl ListenerList {
    pub const fn new() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Listener) {
        self.listeners.borrow_mut().push(listener);
    }

    pub fn remove(&self, barrier: &Rc<PlugBarrier>) {
        self.listeners
            .borrow_mut()
            .retain(|l| !Rc::ptr_eq(&l.barrier, barrier));
    }

    fn publish(&self, element_id: u8, plug_index: u8, msg: &Message) {
        for listener in self.listeners.borrow().iter() {
            listener.barrier.resume_first((
                PlugInfo {
                    element_id,
                    plug_index,
                    source_index: 0,
                },
                *msg,
            ));
        }
    }
}

/// One element of an interface: an id, its subscriptions, and a reference to
/// the interface-wide listener list.
pub struct Element {
    pub id: u8,
    pub subscribers: SubscriberList,
    pub listeners: Rc<ListenerList>,
}

impl Element {
    pub fn new(id: u8, listeners: Rc<ListenerList>) -> Self {
        Self {
            id,
            subscribers: SubscriberList::new(),
            listeners,
        }
    }

    pub fn publish(&self, plug_index: u8, msg: Message) {
        self.listeners.publish(self.id, plug_index, &msg);
        self.subscribers.publish(plug_index, &msg);
    }

    pub fn publish_switch(&self, plug_index: u8, value: u8) {
        self.publish(plug_index, Message::OnOff(value));
    }

    pub fn publish_up_down(&self, plug_index: u8, value: u8) {
        self.publish(plug_index, Message::UpDown(value));
    }

    pub fn publish_float(&self, plug_index: u8, value: f32) {
        self.publish(plug_index, Message::Level(value.into()));
    }

    pub fn publish_float_command(
        &self,
        plug_index: u8,
        value: f32,
        command: u8,
    ) {
        self.publish(
            plug_index,
            Message::Level(FloatWithFlag::new(value, command != 0)),
        );
    }

    /// Publishes a level with a transition time in tenths of a second.
    pub fn publish_float_transition(
        &self,
        plug_index: u8,
        value: f32,
        command: u8,
        transition: u16,
    ) {
        self.publish(
            plug_index,
            Message::MoveToLevel {
                level: FloatWithFlag::new(value, command != 0),
                mov: FloatWithFlag::new(transition as f32 * 0.1, false),
            },
        );
    }
}
