// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Acknowledge wait list.
//!
//! Coroutines that sent a PDU expecting a reply park here, keyed by
//! (connection, expected message type, message id). The receive pump hands
//! the reply's body (bytes after the message type) to the matching waiter.
//! Waits are always raced against a timeout via `select2`; dropping the
//! losing wait removes its registration.

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use mqttsn::MsgType;

pub const MAX_ACK_LENGTH: usize = 16;

pub type AckData = heapless::Vec<u8, MAX_ACK_LENGTH>;

struct AckWaiter {
    key: u32,
    connection: usize,
    msg_type: MsgType,
    msg_id: u16,
    value: Option<AckData>,
    waker: Option<Waker>,
}

#[derive(Default)]
pub struct AckWaitList {
    waiters: RefCell<Vec<AckWaiter>>,
    next_key: Cell<u32>,
}

impl AckWaitList {
    pub const fn new() -> Self {
        Self {
            waiters: RefCell::new(Vec::new()),
            next_key: Cell::new(0),
        }
    }

    /// Waits for a reply of `msg_type` with `msg_id` from `connection`.
    /// Message types without an id (CONNACK, PINGRESP) use id zero.
    pub fn wait(
        &self,
        connection: usize,
        msg_type: MsgType,
        msg_id: u16,
    ) -> AckWait<'_> {
        let key = self.next_key.get();
        self.next_key.set(key.wrapping_add(1));
        self.waiters.borrow_mut().push(AckWaiter {
            key,
            connection,
            msg_type,
            msg_id,
            value: None,
            waker: None,
        });
        AckWait {
            list: self,
            key: Some(key),
        }
    }

    /// Delivers a reply to the first matching waiter. False when nobody was
    /// waiting for it.
    pub fn resume_one(
        &self,
        connection: usize,
        msg_type: MsgType,
        msg_id: u16,
        body: &[u8],
    ) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        for w in waiters.iter_mut() {
            if w.value.is_none()
                && w.connection == connection
                && w.msg_type == msg_type
                && w.msg_id == msg_id
            {
                let mut data = AckData::new();
                data.extend_from_slice(
                    &body[..body.len().min(MAX_ACK_LENGTH)],
                )
                .ok();
                w.value = Some(data);
                if let Some(waker) = w.waker.take() {
                    waker.wake();
                }
                return true;
            }
        }
        false
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

pub struct AckWait<'a> {
    list: &'a AckWaitList,
    key: Option<u32>,
}

impl Future for AckWait<'_> {
    type Output = AckData;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AckData> {
        let Some(key) = self.key else {
            return Poll::Pending;
        };
        let mut waiters = self.list.waiters.borrow_mut();
        let Some(pos) = waiters.iter().position(|w| w.key == key) else {
            return Poll::Pending;
        };
        if waiters[pos].value.is_some() {
            let w = waiters.remove(pos);
            drop(waiters);
            self.key = None;
            Poll::Ready(w.value.unwrap())
        } else {
            waiters[pos].waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for AckWait<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            let mut waiters = self.list.waiters.borrow_mut();
            if let Some(pos) = waiters.iter().position(|w| w.key == key) {
                waiters.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::{RawWaker, RawWakerVTable};

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
    fn delivers_on_matching_key() {
        let list = AckWaitList::new();
        let mut cx = noop_context();
        let mut wait = list.wait(2, MsgType::Puback, 0x33);
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());

        // wrong connection, type, or id: not delivered
        assert!(!list.resume_one(1, MsgType::Puback, 0x33, &[1]));
        assert!(!list.resume_one(2, MsgType::Suback, 0x33, &[1]));
        assert!(!list.resume_one(2, MsgType::Puback, 0x44, &[1]));
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());

        assert!(list.resume_one(2, MsgType::Puback, 0x33, &[9, 8]));
        match Pin::new(&mut wait).poll(&mut cx) {
            Poll::Ready(data) => assert_eq!(&data[..], &[9, 8]),
            Poll::Pending => panic!("not delivered"),
        }
        assert_eq!(list.waiter_count(), 0);
    }

    #[test]
    fn drop_removes_registration() {
        let list = AckWaitList::new();
        let wait = list.wait(0, MsgType::Connack, 0);
        assert_eq!(list.waiter_count(), 1);
        drop(wait);
        assert_eq!(list.waiter_count(), 0);
        assert!(!list.resume_one(0, MsgType::Connack, 0, &[]));
    }
}
