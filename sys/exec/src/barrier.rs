// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

/// A wait list of coroutines that are resumed with a value.
///
/// The resumer decides who gets resumed: `resume_first` hands the value to
/// the oldest waiter that has not been handed one yet, `resume_all` to every
/// waiter. Filtering (such as message conversion) happens in the resumer
/// before delivery; a waiter that is handed nothing stays suspended.
pub struct Barrier<T> {
    waiters: RefCell<Vec<Waiter<T>>>,
    next_key: Cell<u32>,
}

struct Waiter<T> {
    key: u32,
    waker: Option<Waker>,
    value: Option<T>,
}

impl<T> Barrier<T> {
    pub const fn new() -> Self {
        Self {
            waiters: RefCell::new(Vec::new()),
            next_key: Cell::new(0),
        }
    }

    pub fn wait(&self) -> BarrierWait<'_, T> {
        BarrierWait {
            barrier: self,
            key: None,
        }
    }

    /// Delivers `value` to the oldest waiter that has no value yet. Returns
    /// false if nobody was waiting.
    pub fn resume_first(&self, value: T) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        for w in waiters.iter_mut() {
            if w.value.is_none() {
                w.value = Some(value);
                if let Some(waker) = w.waker.take() {
                    waker.wake();
                }
                return true;
            }
        }
        false
    }

    /// Delivers `value` to every waiter that has no value yet.
    pub fn resume_all(&self, value: T)
    where
        T: Clone,
    {
        let mut waiters = self.waiters.borrow_mut();
        for w in waiters.iter_mut() {
            if w.value.is_none() {
                w.value = Some(value.clone());
                if let Some(waker) = w.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

impl<T> Default for Barrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BarrierWait<'a, T> {
    barrier: &'a Barrier<T>,
    key: Option<u32>,
}

impl<T> Future for BarrierWait<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut waiters = self.barrier.waiters.borrow_mut();
        match self.key {
            None => {
                let key = self.barrier.next_key.get();
                self.barrier.next_key.set(key.wrapping_add(1));
                waiters.push(Waiter {
                    key,
                    waker: Some(cx.waker().clone()),
                    value: None,
                });
                drop(waiters);
                self.key = Some(key);
                Poll::Pending
            }
            Some(key) => {
                let Some(i) = waiters.iter().position(|w| w.key == key) else {
                    // registration vanished (barrier dropped our entry);
                    // stay suspended forever rather than invent a value
                    return Poll::Pending;
                };
                if waiters[i].value.is_some() {
                    let w = waiters.remove(i);
                    drop(waiters);
                    self.key = None;
                    Poll::Ready(w.value.unwrap())
                } else {
                    waiters[i].waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

impl<T> Drop for BarrierWait<'_, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            let mut waiters = self.barrier.waiters.borrow_mut();
            if let Some(i) = waiters.iter().position(|w| w.key == key) {
                waiters.remove(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        const VTABLE: RawWakerVTable = RawWakerVTable::new(
            |_| RawWaker::new(core::ptr::null(), &VTABLE),
            |_| {},
            |_| {},
            |_| {},
        );
        unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn resume_first_order() {
        let barrier: Barrier<u32> = Barrier::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut w1 = barrier.wait();
        let mut w2 = barrier.wait();
        assert!(Pin::new(&mut w1).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut w2).poll(&mut cx).is_pending());
        assert_eq!(barrier.waiter_count(), 2);

        assert!(barrier.resume_first(11));
        // oldest waiter gets the value; the other stays pending
        assert_eq!(Pin::new(&mut w1).poll(&mut cx), Poll::Ready(11));
        assert!(Pin::new(&mut w2).poll(&mut cx).is_pending());
        assert_eq!(barrier.waiter_count(), 1);
    }

    #[test]
    fn resume_all_delivers_to_everyone() {
        let barrier: Barrier<u32> = Barrier::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut w1 = barrier.wait();
        let mut w2 = barrier.wait();
        let _ = Pin::new(&mut w1).poll(&mut cx);
        let _ = Pin::new(&mut w2).poll(&mut cx);

        barrier.resume_all(5);
        assert_eq!(Pin::new(&mut w1).poll(&mut cx), Poll::Ready(5));
        assert_eq!(Pin::new(&mut w2).poll(&mut cx), Poll::Ready(5));
    }

    #[test]
    fn drop_removes_waiter() {
        let barrier: Barrier<u32> = Barrier::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut w = barrier.wait();
        let _ = Pin::new(&mut w).poll(&mut cx);
        assert_eq!(barrier.waiter_count(), 1);
        drop(w);
        assert_eq!(barrier.waiter_count(), 0);
        assert!(!barrier.resume_first(1));
    }
}
