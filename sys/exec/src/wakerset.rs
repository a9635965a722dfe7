// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;
use core::cell::RefCell;
use core::task::Waker;

/// A wait list of wakers, for drivers whose completion carries no payload
/// beyond "look at my state again".
#[derive(Default)]
pub struct WakerSet {
    wakers: RefCell<Vec<Waker>>,
}

impl WakerSet {
    pub const fn new() -> Self {
        Self {
            wakers: RefCell::new(Vec::new()),
        }
    }

    /// Registers a waker unless an equivalent one is already present.
    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&self) {
        for w in self.wakers.borrow_mut().drain(..) {
            w.wake();
        }
    }

    pub fn wake_one(&self) {
        let mut wakers = self.wakers.borrow_mut();
        if !wakers.is_empty() {
            wakers.remove(0).wake();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wakers.borrow().is_empty()
    }
}
