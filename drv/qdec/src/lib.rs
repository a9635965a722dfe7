// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quadrature decoder.
//!
//! The hardware accumulates raw quadrature counts; the glue feeds them in
//! with [`Qdec::on_raw`], and waiters receive the accumulated delta in
//! detents (raw counts divided by four) whenever it is non-zero.

#![cfg_attr(target_os = "none", no_std)]

use core::cell::Cell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use exec::WakerSet;

pub struct Qdec {
    accumulated: Cell<i32>,
    wakers: WakerSet,
}

impl Qdec {
    pub const fn new() -> Self {
        Self {
            accumulated: Cell::new(0),
            wakers: WakerSet::new(),
        }
    }

    /// Adds raw counts from the hardware accumulator.
    pub fn on_raw(&self, raw: i32) {
        self.accumulated
            .set(self.accumulated.get().wrapping_add(raw));
        if self.accumulated.get() / 4 != 0 {
            self.wakers.wake_all();
        }
    }

    /// Waits for a non-zero detent delta and consumes it.
    pub fn delta(&self) -> Delta<'_> {
        Delta { qdec: self }
    }
}

impl Default for Qdec {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Delta<'a> {
    qdec: &'a Qdec,
}

impl Future for Delta<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        let acc = self.qdec.accumulated.get();
        let detents = acc / 4;
        if detents != 0 {
            // keep the fractional remainder for the next turn
            self.qdec.accumulated.set(acc - detents * 4);
            Poll::Ready(detents)
        } else {
            self.qdec.wakers.register(cx.waker());
            Poll::Pending
        }
    }
}
