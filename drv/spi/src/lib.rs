// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-channel SPI master.
//!
//! One hardware peripheral serves several channels, each owning a chip
//! select and optionally a data/command pin (which may share MISO in
//! write-only setups). Transfers queue per driver and run one at a time in
//! submission order; each specifies a write buffer, a read length, and an
//! optional command marker. On the wire to the hardware the marker rides in
//! the sign bit of the write count, the way the DMA job encodes it.
//!
//! The glue calls [`SpiMaster::on_complete`] when the hardware finishes a
//! transfer, delivering the read bytes to the waiting future and starting
//! the next queued transfer.

#![cfg_attr(target_os = "none", no_std)]

use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

pub const MAX_TRANSFER: usize = 32;
pub const QUEUE_LENGTH: usize = 4;

pub type Data = heapless::Vec<u8, MAX_TRANSFER>;

/// What the driver needs from the hardware: start one DMA transfer on a
/// channel. `write_count < 0` flags a command transfer (data/command pin
/// low); the magnitude is the number of bytes to write.
pub trait SpiHw {
    fn start(&self, channel: usize, write_count: i32, write: &[u8], read_count: usize);
}

#[derive(Copy, Clone, PartialEq)]
enum OpState {
    Queued,
    Active,
    Done,
}

/// Ordered removal keeps the submission order of the remaining queue.
fn remove_op(
    ops: &mut heapless::Vec<TransferOp, QUEUE_LENGTH>,
    pos: usize,
) {
    for i in pos..ops.len() - 1 {
        let next = core::mem::replace(
            &mut ops[i + 1],
            TransferOp {
                key: 0,
                channel: 0,
                write: Data::new(),
                read_count: 0,
                command: false,
                read: Data::new(),
                state: OpState::Done,
                waker: None,
            },
        );
        ops[i] = next;
    }
    ops.truncate(ops.len() - 1);
}

struct TransferOp {
    key: u32,
    channel: usize,
    write: Data,
    read_count: usize,
    command: bool,
    read: Data,
    state: OpState,
    waker: Option<Waker>,
}

pub struct SpiMaster<H: SpiHw> {
    hw: H,
    ops: RefCell<heapless::Vec<TransferOp, QUEUE_LENGTH>>,
    next_key: Cell<u32>,
}

impl<H: SpiHw> SpiMaster<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            ops: RefCell::new(heapless::Vec::new()),
            next_key: Cell::new(0),
        }
    }

    /// Queues a transfer; the future resolves with the read bytes. A full
    /// queue resolves immediately with an empty read.
    pub fn transfer(
        &self,
        channel: usize,
        write: &[u8],
        read_count: usize,
        command: bool,
    ) -> Transfer<'_, H> {
        let mut ops = self.ops.borrow_mut();
        let key = self.next_key.get();
        self.next_key.set(key.wrapping_add(1));
        let op = TransferOp {
            key,
            channel,
            write: Data::from_slice(&write[..write.len().min(MAX_TRANSFER)])
                .unwrap_or_default(),
            read_count: read_count.min(MAX_TRANSFER),
            command,
            read: Data::new(),
            state: OpState::Queued,
            waker: None,
        };
        let key = if ops.push(op).is_err() { None } else { Some(key) };
        let idle = !ops.iter().any(|op| op.state == OpState::Active);
        drop(ops);
        if key.is_some() && idle {
            self.start_next();
        }
        Transfer { spi: self, key }
    }

    /// The hardware finished the active transfer with `read` bytes.
    pub fn on_complete(&self, read: &[u8]) {
        {
            let mut ops = self.ops.borrow_mut();
            if let Some(op) =
                ops.iter_mut().find(|op| op.state == OpState::Active)
            {
                op.read = Data::from_slice(
                    &read[..read.len().min(op.read_count)],
                )
                .unwrap_or_default();
                op.state = OpState::Done;
                if let Some(waker) = op.waker.take() {
                    waker.wake();
                }
            }
        }
        self.start_next();
    }

    fn start_next(&self) {
        let started = {
            let mut ops = self.ops.borrow_mut();
            match ops.iter_mut().find(|op| op.state == OpState::Queued) {
                Some(op) => {
                    op.state = OpState::Active;
                    let count = op.write.len() as i32;
                    Some((
                        op.channel,
                        if op.command { -count } else { count },
                        op.write.clone(),
                        op.read_count,
                    ))
                }
                None => None,
            }
        };
        if let Some((channel, write_count, write, read_count)) = started {
            self.hw.start(channel, write_count, &write, read_count);
        }
    }

    fn remove(&self, key: u32) {
        let mut ops = self.ops.borrow_mut();
        if let Some(pos) = ops.iter().position(|op| op.key == key) {
            remove_op(&mut ops, pos);
        }
    }

    pub fn queued(&self) -> usize {
        self.ops.borrow().len()
    }
}

pub struct Transfer<'a, H: SpiHw> {
    spi: &'a SpiMaster<H>,
    key: Option<u32>,
}

impl<H: SpiHw> Future for Transfer<'_, H> {
    type Output = Data;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Data> {
        let Some(key) = self.key else {
            return Poll::Ready(Data::new());
        };
        let mut ops = self.spi.ops.borrow_mut();
        let Some(pos) = ops.iter().position(|op| op.key == key) else {
            return Poll::Ready(Data::new());
        };
        if ops[pos].state == OpState::Done {
            let read = core::mem::take(&mut ops[pos].read);
            remove_op(&mut ops, pos);
            drop(ops);
            self.key = None;
            Poll::Ready(read)
        } else {
            ops[pos].waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<H: SpiHw> Drop for Transfer<'_, H> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.spi.remove(key);
        }
    }
}
