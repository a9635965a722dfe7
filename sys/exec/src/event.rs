// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::WakerSet;
use core::cell::Cell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Level-triggered event. `wait()` completes while the event is set; the
/// owner clears it explicitly once the condition it signals is drained.
#[derive(Default)]
pub struct Event {
    set: Cell<bool>,
    wakers: WakerSet,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            set: Cell::new(false),
            wakers: WakerSet::new(),
        }
    }

    pub fn set(&self) {
        self.set.set(true);
        self.wakers.wake_all();
    }

    pub fn clear(&self) {
        self.set.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.set.get()
    }

    pub fn wait(&self) -> EventWait<'_> {
        EventWait { event: self }
    }
}

pub struct EventWait<'a> {
    event: &'a Event,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.event.set.get() {
            Poll::Ready(())
        } else {
            self.event.wakers.register(cx.waker());
            Poll::Pending
        }
    }
}
