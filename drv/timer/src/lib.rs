// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monotonic timer and wall-clock calendar.
//!
//! The timer multiplexes one hardware compare channel over any number of
//! sleeping coroutines. The hardware side is a 24 bit counter running at
//! 16384 Hz that overflows every 1024 s; a software base time advances by
//! that interval on overflow, and `now()` converts counter plus base to the
//! ~1 ms [`SystemTime`] scale. The compare register is always programmed to
//! the earliest pending deadline; `poll()` runs from the event loop when the
//! compare fires and resumes every expired sleeper.
//!
//! The calendar keeps weekday/hour/minute/second, advanced by a 1 Hz tick
//! derived from the same low-speed clock, and hands out an awaitable that
//! resumes once per second.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use exec::WakerSet;
use systime::{ClockTime, SystemDuration, SystemTime};

/// Timer interval: 2^24 counter ticks at 16384 Hz is 1024 s.
const INTERVAL_MS: u32 = 1_024_000;

/// Low-power counter behind the timer. 24 bits at 16384 Hz.
pub trait Rtc {
    fn counter(&self) -> u32;

    /// True once after each counter overflow; reading clears the event.
    fn take_overflow(&self) -> bool;

    /// Programs the compare channel, in counter ticks.
    fn set_compare(&self, ticks: u32);
}

impl<T: Rtc + ?Sized> Rtc for alloc::rc::Rc<T> {
    fn counter(&self) -> u32 {
        (**self).counter()
    }

    fn take_overflow(&self) -> bool {
        (**self).take_overflow()
    }

    fn set_compare(&self, ticks: u32) {
        (**self).set_compare(ticks)
    }
}

fn counter_to_ms(counter: u32) -> u32 {
    // 16384 Hz to milliseconds: x * 1000 / 16384 = x * 125 >> 11
    (counter * 125 + 1024) >> 11
}

fn ms_to_counter(ms: u32) -> u32 {
    (ms << 11) / 125
}

struct Sleeper {
    key: u32,
    deadline: SystemTime,
    waker: Waker,
}

struct TimerState {
    base_ms: u32,
    next: SystemTime,
    next_key: u32,
    sleepers: Vec<Sleeper>,
}

pub struct Timer<R: Rtc> {
    rtc: R,
    state: RefCell<TimerState>,
}

impl<R: Rtc> Timer<R> {
    pub fn new(rtc: R) -> Self {
        let next = SystemTime(INTERVAL_MS - 1);
        rtc.set_compare(ms_to_counter(next.0));
        Self {
            rtc,
            state: RefCell::new(TimerState {
                base_ms: 0,
                next,
                next_key: 0,
                sleepers: Vec::new(),
            }),
        }
    }

    /// Current system time with ~1 ms resolution.
    pub fn now(&self) -> SystemTime {
        let mut counter = self.rtc.counter();
        let mut state = self.state.borrow_mut();
        if self.rtc.take_overflow() {
            // reload in case the overflow happened after the first read
            counter = self.rtc.counter();
            state.base_ms = state.base_ms.wrapping_add(INTERVAL_MS);
        }
        SystemTime(state.base_ms.wrapping_add(counter_to_ms(counter)))
    }

    /// Suspends until `time`. Completes immediately if it already passed.
    pub fn sleep(&self, time: SystemTime) -> Sleep<'_, R> {
        Sleep {
            timer: self,
            deadline: time,
            key: None,
        }
    }

    pub fn sleep_for(&self, duration: SystemDuration) -> Sleep<'_, R> {
        self.sleep(self.now() + duration)
    }

    /// Resumes expired sleepers and reprograms the compare channel. Runs
    /// from the event loop whenever the compare or overflow event fires.
    pub fn poll(&self) {
        loop {
            let now = self.now();
            let mut state = self.state.borrow_mut();
            let mut fired = false;
            state.sleepers.retain(|s| {
                if s.deadline <= now {
                    s.waker.wake_by_ref();
                    fired = true;
                    false
                } else {
                    true
                }
            });
            let next = state
                .sleepers
                .iter()
                .map(|s| s.deadline)
                .min()
                .unwrap_or(now + SystemDuration(INTERVAL_MS as i32 - 1));
            state.next = next;
            // deadlines beyond the counter window re-arm on overflow
            let compare = next
                .0
                .wrapping_sub(state.base_ms)
                .min(INTERVAL_MS - 1);
            drop(state);
            self.rtc.set_compare(ms_to_counter(compare));

            // repeat until the programmed deadline is in the future
            if !(fired && self.now() >= next) {
                break;
            }
        }
    }

    fn register(
        &self,
        deadline: SystemTime,
        waker: &Waker,
        key: Option<u32>,
    ) -> u32 {
        let mut state = self.state.borrow_mut();
        if let Some(k) = key {
            if let Some(s) =
                state.sleepers.iter_mut().find(|s| s.key == k)
            {
                s.waker = waker.clone();
                return k;
            }
        }
        let key = state.next_key;
        state.next_key = state.next_key.wrapping_add(1);
        state.sleepers.push(Sleeper {
            key,
            deadline,
            waker: waker.clone(),
        });
        if deadline < state.next {
            state.next = deadline;
            let compare = deadline
                .0
                .wrapping_sub(state.base_ms)
                .min(INTERVAL_MS - 1);
            drop(state);
            self.rtc.set_compare(ms_to_counter(compare));
        }
        key
    }

    fn deregister(&self, key: u32) {
        let mut state = self.state.borrow_mut();
        state.sleepers.retain(|s| s.key != key);
    }

    pub fn sleeper_count(&self) -> usize {
        self.state.borrow().sleepers.len()
    }
}

pub struct Sleep<'a, R: Rtc> {
    timer: &'a Timer<R>,
    deadline: SystemTime,
    key: Option<u32>,
}

impl<R: Rtc> Future for Sleep<'_, R> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.timer.now() >= self.deadline {
            if let Some(key) = self.key.take() {
                self.timer.deregister(key);
            }
            return Poll::Ready(());
        }
        let key = self.timer.register(self.deadline, cx.waker(), self.key);
        self.key = Some(key);
        Poll::Pending
    }
}

impl<R: Rtc> Drop for Sleep<'_, R> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.timer.deregister(key);
        }
    }
}

/// Wall clock, advanced at 1 Hz.
pub struct Calendar {
    seconds: Cell<u8>,
    minutes: Cell<u8>,
    hours: Cell<u8>,
    weekday: Cell<u8>,
    ticks: Cell<u32>,
    wakers: WakerSet,
}

impl Calendar {
    pub const fn new() -> Self {
        Self {
            seconds: Cell::new(0),
            minutes: Cell::new(0),
            hours: Cell::new(0),
            weekday: Cell::new(0),
            ticks: Cell::new(0),
            wakers: WakerSet::new(),
        }
    }

    pub fn set(&self, time: ClockTime) {
        self.seconds.set(time.seconds());
        self.minutes.set(time.minutes());
        self.hours.set(time.hours());
        self.weekday.set(time.weekday());
    }

    pub fn now(&self) -> ClockTime {
        ClockTime::new(
            self.weekday.get(),
            self.hours.get(),
            self.minutes.get(),
            self.seconds.get(),
        )
    }

    /// Advances the clock by one second and resumes tick waiters. Runs from
    /// the event loop on the 1 Hz compare event.
    pub fn tick(&self) {
        let s = self.seconds.get() + 1;
        if s == 60 {
            self.seconds.set(0);
            let m = self.minutes.get() + 1;
            if m == 60 {
                self.minutes.set(0);
                let h = self.hours.get() + 1;
                if h == 24 {
                    self.hours.set(0);
                    self.weekday.set((self.weekday.get() + 1) % 7);
                } else {
                    self.hours.set(h);
                }
            } else {
                self.minutes.set(m);
            }
        } else {
            self.seconds.set(s);
        }
        self.ticks.set(self.ticks.get().wrapping_add(1));
        self.wakers.wake_all();
    }

    /// Resumes on the next 1 Hz tick.
    pub fn second_tick(&self) -> SecondTick<'_> {
        SecondTick {
            calendar: self,
            start: self.ticks.get(),
        }
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SecondTick<'a> {
    calendar: &'a Calendar,
    start: u32,
}

impl Future for SecondTick<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.calendar.ticks.get() != self.start {
            Poll::Ready(())
        } else {
            self.calendar.wakers.register(cx.waker());
            Poll::Pending
        }
    }
}
