// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Field-bus master.
//!
//! The bus is UART at 19200 baud over a LIN-style physical layer: zeros are
//! dominant, ones recessive. Every transaction starts with a BREAK (13
//! dominant bits), a half-bit pause, and the SYNC byte 0x55. During transfer
//! the master reads back every byte it writes; a mismatch, or a dominant
//! line where it expected recessive, means another sender won arbitration:
//! the master stops transmitting and keeps receiving, so the surviving
//! sender's bytes are what land in the receive buffer. A transfer ends when
//! the line has been quiet for twenty bit times.
//!
//! A node wanting to be read pulls the line low in idle; the master answers
//! with a BREAK and listens. One send and one receive can be active at a
//! time; further requests queue and start when the bus returns to idle.
//!
//! The [`protocol`] module holds the frame formats riding on this framing:
//! arbitration-safe id/address encoding, enumeration and commissioning, and
//! the AES-CCM message integrity code.

#![cfg_attr(target_os = "none", no_std)]

pub mod protocol;

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use exec::{Barrier, BarrierWait};
use ringbuf::{ringbuf, ringbuf_entry};

/// Longest bus frame we handle.
pub const MAX_MESSAGE_LENGTH: usize = 64;

pub type Frame = heapless::Vec<u8, MAX_MESSAGE_LENGTH>;

const SYNC: u8 = 0x55;

/// BREAK is 13 dominant bit times at 19200 baud, rounded like the firmware
/// does.
pub const BREAK_US: u32 = 677;

/// Recessive pause after BREAK: half a bit time.
pub const PAUSE_US: u32 = 1_000_000 / (19_200 * 2);

/// End-of-frame timeout: twenty bit times of silence.
pub const TIMEOUT_US: u32 = 20 * 1_000_000 / 19_200;

/// What the master needs from the UART and its timer.
pub trait BusUart {
    /// Drives the TX line dominant (true) or recessive (false), bypassing
    /// the UART, for BREAK generation.
    fn set_break(&self, on: bool);
    /// Queues one byte for transmission.
    fn write_byte(&self, byte: u8);
    fn stop_tx(&self);
    /// Samples the RX line level; true is recessive.
    fn read_line(&self) -> bool;
    /// One-shot timer, microseconds from now.
    fn set_timer(&self, after_us: u32);
    fn stop_timer(&self);
}

/// Events fed into [`BusMaster::on_event`] from event-loop context.
#[derive(Debug)]
pub enum BusEvent {
    RxByte(u8),
    Timer,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum LineState {
    Idle,
    Break,
    Pause,
    Sync,
    Transfer,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum TxState {
    Idle,
    /// A send is staged and starts at the next SYNC.
    Pending,
    Active,
    /// All bytes out; waiting for the end-of-frame timeout.
    End,
}

#[derive(Copy, Clone, PartialEq)]
enum OpState {
    Queued,
    Active,
    Done,
}

struct SendOp {
    key: u32,
    data: Frame,
    state: OpState,
    waker: Option<Waker>,
}

/// Ordered removal keeps queued sends in submission order.
fn remove_send_op(
    sends: &mut heapless::Vec<SendOp, 4>,
    pos: usize,
) {
    for i in pos..sends.len() - 1 {
        let next = core::mem::replace(
            &mut sends[i + 1],
            SendOp {
                key: 0,
                data: Frame::new(),
                state: OpState::Done,
                waker: None,
            },
        );
        sends[i] = next;
    }
    sends.truncate(sends.len() - 1);
}

struct MasterState {
    line: LineState,
    tx: TxState,
    tx_index: usize,
    tx_byte: u8,
    rx_active: bool,
    rx_buf: Frame,
    next_key: u32,
    sends: heapless::Vec<SendOp, 4>,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    BreakStart,
    SyncError(u8),
    ArbitrationLost(usize),
    TxDone,
    RxDone(usize),
}

ringbuf!(Trace, 16, Trace::None);

pub struct BusMaster<U: BusUart> {
    uart: U,
    st: RefCell<MasterState>,
    rx_barrier: Barrier<Frame>,
}

impl<U: BusUart> BusMaster<U> {
    pub fn new(uart: U) -> Self {
        Self {
            uart,
            st: RefCell::new(MasterState {
                line: LineState::Idle,
                tx: TxState::Idle,
                tx_index: 0,
                tx_byte: 0,
                rx_active: false,
                rx_buf: Frame::new(),
                next_key: 0,
                sends: heapless::Vec::new(),
            }),
            rx_barrier: Barrier::new(),
        }
    }

    /// Waits for the next complete frame on the bus. The frame contains
    /// every byte seen on the wire after SYNC, including the master's own
    /// when it was sending.
    pub fn receive(&self) -> BarrierWait<'_, Frame> {
        self.rx_barrier.wait()
    }

    /// Queues `data` for transmission and completes once it went out
    /// intact. Lost arbitration is retried at the next idle.
    pub fn send<'a>(&'a self, data: &[u8]) -> BusSend<'a, U> {
        let mut st = self.st.borrow_mut();
        let key = st.next_key;
        st.next_key = st.next_key.wrapping_add(1);
        let op = SendOp {
            key,
            data: Frame::from_slice(&data[..data.len().min(MAX_MESSAGE_LENGTH)])
                .unwrap(),
            state: OpState::Queued,
            waker: None,
        };
        let key = if data.is_empty() || st.sends.push(op).is_err() {
            None
        } else {
            Some(key)
        };
        if key.is_some()
            && st.line == LineState::Idle
            && self.stage_next_send(&mut st)
        {
            self.start_break(&mut st);
        }
        drop(st);
        BusSend { bus: self, key }
    }

    pub fn on_event(&self, event: BusEvent) {
        let mut st = self.st.borrow_mut();
        match event {
            BusEvent::RxByte(byte) => self.on_rx_byte(&mut st, byte),
            BusEvent::Timer => self.on_timer(&mut st),
        }
    }

    fn on_rx_byte(&self, st: &mut MasterState, byte: u8) {
        match st.line {
            LineState::Idle => {
                // a node pulled the line low: it wants to be read
                self.start_break(st);
            }
            LineState::Sync => {
                if byte != SYNC {
                    ringbuf_entry!(Trace::SyncError(byte));
                    self.start_break(st);
                    return;
                }
                // sync ok, the transfer begins
                st.rx_active = true;
                st.rx_buf.clear();
                if st.tx == TxState::Pending {
                    st.tx = TxState::Active;
                    st.tx_index = 1;
                    let b = self.active_send(st)[0];
                    st.tx_byte = b;
                    self.uart.write_byte(b);
                } else {
                    self.uart.stop_tx();
                }
                st.line = LineState::Transfer;
                self.uart.set_timer(TIMEOUT_US);
            }
            LineState::Transfer => {
                self.uart.set_timer(TIMEOUT_US);
                if st.tx == TxState::Active {
                    if byte == st.tx_byte && self.uart.read_line() {
                        let data = self.active_send(st);
                        if st.tx_index < data.len() {
                            let b = data[st.tx_index];
                            st.tx_index += 1;
                            st.tx_byte = b;
                            self.uart.write_byte(b);
                        } else {
                            self.uart.stop_tx();
                            st.tx = TxState::End;
                        }
                    } else {
                        // another sender won the arbitration
                        ringbuf_entry!(Trace::ArbitrationLost(
                            st.tx_index
                        ));
                        self.uart.stop_tx();
                        st.tx = TxState::Pending;
                    }
                } else if st.tx == TxState::End {
                    // an extra byte after our frame: treat as collision
                    st.tx = TxState::Pending;
                }
                if st.rx_active && !st.rx_buf.is_full() {
                    st.rx_buf.push(byte).ok();
                }
            }
            LineState::Break | LineState::Pause => {}
        }
    }

    fn on_timer(&self, st: &mut MasterState) {
        match st.line {
            LineState::Break => {
                // end of break, recessive pause
                self.uart.set_break(false);
                st.line = LineState::Pause;
                self.uart.set_timer(PAUSE_US);
            }
            LineState::Pause => {
                // transfer starts with the sync byte
                st.line = LineState::Sync;
                self.uart.write_byte(SYNC);
                self.uart.set_timer(TIMEOUT_US);
            }
            _ => {
                // quiet line: end of transfer
                self.uart.stop_timer();
                if st.tx == TxState::End {
                    ringbuf_entry!(Trace::TxDone);
                    st.tx = TxState::Idle;
                    self.finish_send(st);
                }
                if st.rx_active {
                    st.rx_active = false;
                    let frame = core::mem::take(&mut st.rx_buf);
                    ringbuf_entry!(Trace::RxDone(frame.len()));
                    self.rx_barrier.resume_first(frame);
                }
                st.line = LineState::Idle;
                // a pending or queued send starts the next transaction
                if st.tx == TxState::Pending {
                    self.start_break(st);
                } else if self.stage_next_send(st) {
                    self.start_break(st);
                }
            }
        }
    }

    /// Promotes the oldest queued send to pending. False if none.
    fn stage_next_send(&self, st: &mut MasterState) -> bool {
        if st.tx != TxState::Idle {
            return false;
        }
        if let Some(op) =
            st.sends.iter_mut().find(|op| op.state == OpState::Queued)
        {
            op.state = OpState::Active;
            st.tx = TxState::Pending;
            st.tx_index = 0;
            true
        } else {
            false
        }
    }

    fn active_send(&self, st: &MasterState) -> Frame {
        st.sends
            .iter()
            .find(|op| op.state == OpState::Active)
            .map(|op| op.data.clone())
            .unwrap_or_default()
    }

    fn finish_send(&self, st: &mut MasterState) {
        if let Some(op) =
            st.sends.iter_mut().find(|op| op.state == OpState::Active)
        {
            op.state = OpState::Done;
            if let Some(waker) = op.waker.take() {
                waker.wake();
            }
        }
    }

    fn start_break(&self, st: &mut MasterState) {
        ringbuf_entry!(Trace::BreakStart);
        self.uart.stop_tx();
        self.uart.set_break(true);
        st.line = LineState::Break;
        self.uart.set_timer(BREAK_US);
    }

    fn cancel_send(&self, key: u32) {
        let mut st = self.st.borrow_mut();
        let Some(pos) =
            st.sends.iter().position(|op| op.key == key)
        else {
            return;
        };
        let was_active = st.sends[pos].state == OpState::Active;
        remove_send_op(&mut st.sends, pos);
        if was_active && st.tx != TxState::Idle {
            // abandon the transmission; the line state machine finishes the
            // frame timeout on its own
            self.uart.stop_tx();
            st.tx = TxState::Idle;
        }
    }
}

/// Future of a queued send. Dropping it cancels the request.
pub struct BusSend<'a, U: BusUart> {
    bus: &'a BusMaster<U>,
    key: Option<u32>,
}

impl<U: BusUart> Future for BusSend<'_, U> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let Some(key) = self.key else {
            // rejected at submit time (empty frame or queue full)
            return Poll::Ready(false);
        };
        let mut st = self.bus.st.borrow_mut();
        let Some(pos) =
            st.sends.iter().position(|op| op.key == key)
        else {
            return Poll::Ready(false);
        };
        match st.sends[pos].state {
            OpState::Done => {
                remove_send_op(&mut st.sends, pos);
                drop(st);
                self.key = None;
                Poll::Ready(true)
            }
            _ => {
                st.sends[pos].waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<U: BusUart> Drop for BusSend<'_, U> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.bus.cancel_send(key);
        }
    }
}

#[cfg(test)]
mod tests;
