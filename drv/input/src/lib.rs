// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debounced edge-triggered inputs.
//!
//! Up to eight lines. Any edge arms a ~50 ms deadline for its line; when
//! the deadline expires the level is read back, and if it differs from the
//! last stable value, waiters whose rising/falling masks match are resumed
//! with the line index and the new level. Events are delivered in the
//! order the debounced edges settle.
//!
//! The glue feeds edges with [`Inputs::on_edge`] and calls
//! [`Inputs::poll`] when the deadline timer fires; [`Inputs::next_deadline`]
//! tells it what to program.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use systime::{ms, SystemTime};

pub const INPUT_COUNT: usize = 8;

/// Settle time after the last observed edge.
pub const DEBOUNCE: systime::SystemDuration = ms(50);

/// Level access to the raw lines; true is the active level.
pub trait InputPins {
    fn read(&self, index: usize) -> bool;
}

struct LineState {
    deadline: Option<SystemTime>,
    value: bool,
}

struct TriggerWaiter {
    key: u32,
    rising: u8,
    falling: u8,
    value: Option<(usize, bool)>,
    waker: Option<Waker>,
}

pub struct Inputs<P: InputPins> {
    pins: P,
    lines: RefCell<[LineState; INPUT_COUNT]>,
    waiters: RefCell<Vec<TriggerWaiter>>,
    next_key: Cell<u32>,
}

impl<P: InputPins> Inputs<P> {
    pub fn new(pins: P) -> Self {
        let lines = core::array::from_fn(|i| LineState {
            deadline: None,
            value: pins.read(i),
        });
        Self {
            pins,
            lines: RefCell::new(lines),
            waiters: RefCell::new(Vec::new()),
            next_key: Cell::new(0),
        }
    }

    /// Current debounced level of a line.
    pub fn read(&self, index: usize) -> bool {
        self.lines.borrow()[index].value
    }

    /// An edge was seen on `index`; (re)arms its debounce deadline.
    pub fn on_edge(&self, index: usize, now: SystemTime) {
        self.lines.borrow_mut()[index].deadline = Some(now + DEBOUNCE);
    }

    /// Earliest pending debounce deadline, for the timer glue.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.lines
            .borrow()
            .iter()
            .filter_map(|l| l.deadline)
            .min()
    }

    /// Settles every line whose deadline expired; resumes matching
    /// waiters for each line whose stable level changed.
    pub fn poll(&self, now: SystemTime) {
        for index in 0..INPUT_COUNT {
            let changed = {
                let mut lines = self.lines.borrow_mut();
                let line = &mut lines[index];
                match line.deadline {
                    Some(deadline) if deadline <= now => {
                        line.deadline = None;
                        let value = self.pins.read(index);
                        let changed = value != line.value;
                        line.value = value;
                        changed.then_some(value)
                    }
                    _ => None,
                }
            };
            if let Some(value) = changed {
                self.resume(index, value);
            }
        }
    }

    fn resume(&self, index: usize, value: bool) {
        let bit = 1u8 << index;
        let mut waiters = self.waiters.borrow_mut();
        for w in waiters.iter_mut() {
            if w.value.is_some() {
                continue;
            }
            let hit = (value && w.rising & bit != 0)
                || (!value && w.falling & bit != 0);
            if hit {
                w.value = Some((index, value));
                if let Some(waker) = w.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    /// Waits for a debounced edge on any line selected by the masks.
    pub fn trigger(&self, rising: u8, falling: u8) -> Trigger<'_, P> {
        let key = self.next_key.get();
        self.next_key.set(key.wrapping_add(1));
        self.waiters.borrow_mut().push(TriggerWaiter {
            key,
            rising,
            falling,
            value: None,
            waker: None,
        });
        Trigger {
            inputs: self,
            key: Some(key),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

pub struct Trigger<'a, P: InputPins> {
    inputs: &'a Inputs<P>,
    key: Option<u32>,
}

impl<P: InputPins> Future for Trigger<'_, P> {
    type Output = (usize, bool);

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<(usize, bool)> {
        let Some(key) = self.key else {
            return Poll::Pending;
        };
        let mut waiters = self.inputs.waiters.borrow_mut();
        let Some(pos) = waiters.iter().position(|w| w.key == key) else {
            return Poll::Pending;
        };
        if let Some(value) = waiters[pos].value {
            waiters.remove(pos);
            drop(waiters);
            self.key = None;
            Poll::Ready(value)
        } else {
            waiters[pos].waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<P: InputPins> Drop for Trigger<'_, P> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            let mut waiters = self.inputs.waiters.borrow_mut();
            if let Some(pos) = waiters.iter().position(|w| w.key == key)
            {
                waiters.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::{RawWaker, RawWakerVTable};

    #[derive(Default)]
    struct FakePins {
        levels: Cell<u8>,
    }

    impl FakePins {
        fn set(&self, index: usize, value: bool) {
            let mut levels = self.levels.get();
            if value {
                levels |= 1 << index;
            } else {
                levels &= !(1 << index);
            }
            self.levels.set(levels);
        }
    }

    impl InputPins for &FakePins {
        fn read(&self, index: usize) -> bool {
            self.levels.get() & 1 << index != 0
        }
    }

    fn noop_context() -> Context<'static> {
        const VTABLE: RawWakerVTable = RawWakerVTable::new(
            |_| RawWaker::new(core::ptr::null(), &VTABLE),
            |_| {},
            |_| {},
            |_| {},
        );
        static WAKER: Waker = unsafe {
            Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE))
        };
        Context::from_waker(&WAKER)
    }

    #[test]
    fn debounced_edge_is_delivered_after_settle() {
        let pins = FakePins::default();
        let inputs = Inputs::new(&pins);
        let mut cx = noop_context();

        let mut trigger = inputs.trigger(0b0000_0010, 0);
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());

        // edge arrives, line settles high
        pins.set(1, true);
        inputs.on_edge(1, SystemTime(0));
        assert_eq!(
            inputs.next_deadline(),
            Some(SystemTime(0) + DEBOUNCE)
        );

        // before the deadline nothing fires
        inputs.poll(SystemTime(10));
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());

        inputs.poll(SystemTime(51));
        assert_eq!(
            Pin::new(&mut trigger).poll(&mut cx),
            Poll::Ready((1, true))
        );
        assert!(inputs.read(1));
    }

    #[test]
    fn bounce_without_level_change_is_swallowed() {
        let pins = FakePins::default();
        let inputs = Inputs::new(&pins);
        let mut cx = noop_context();

        let mut trigger = inputs.trigger(0b1, 0b1);
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());

        // a glitch: edges but the level settles back low
        inputs.on_edge(0, SystemTime(0));
        inputs.on_edge(0, SystemTime(20));
        inputs.poll(SystemTime(80));
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());
    }

    #[test]
    fn mask_filters_lines_and_directions() {
        let pins = FakePins::default();
        let inputs = Inputs::new(&pins);
        let mut cx = noop_context();

        // waiting for a falling edge only
        let mut trigger = inputs.trigger(0, 0b1);
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());

        // rising edge on the line: not delivered
        pins.set(0, true);
        inputs.on_edge(0, SystemTime(0));
        inputs.poll(SystemTime(60));
        assert!(Pin::new(&mut trigger).poll(&mut cx).is_pending());

        // falling edge: delivered
        pins.set(0, false);
        inputs.on_edge(0, SystemTime(100));
        inputs.poll(SystemTime(160));
        assert_eq!(
            Pin::new(&mut trigger).poll(&mut cx),
            Poll::Ready((0, false))
        );
    }

    #[test]
    fn dropped_trigger_deregisters() {
        let pins = FakePins::default();
        let inputs = Inputs::new(&pins);
        let trigger = inputs.trigger(0b1, 0b1);
        assert_eq!(inputs.waiter_count(), 1);
        drop(trigger);
        assert_eq!(inputs.waiter_count(), 0);
    }
}
