// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::vec::Vec;

#[derive(Debug, Clone, PartialEq)]
enum UartOp {
    Break(bool),
    Write(u8),
    StopTx,
}

#[derive(Default)]
struct TestUart {
    ops: RefCell<Vec<UartOp>>,
    line_recessive: Cell<bool>,
    timer_us: Cell<Option<u32>>,
}

impl TestUart {
    fn new() -> Self {
        let u = Self::default();
        u.line_recessive.set(true);
        u
    }

    fn took(&self) -> Vec<UartOp> {
        self.ops.borrow_mut().drain(..).collect()
    }

    fn written(&self) -> Vec<u8> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                UartOp::Write(b) => Some(*b),
                _ => None,
            })
            .collect()
    }
}

impl BusUart for &TestUart {
    fn set_break(&self, on: bool) {
        self.ops.borrow_mut().push(UartOp::Break(on));
    }

    fn write_byte(&self, byte: u8) {
        self.ops.borrow_mut().push(UartOp::Write(byte));
    }

    fn stop_tx(&self) {
        self.ops.borrow_mut().push(UartOp::StopTx);
    }

    fn read_line(&self) -> bool {
        self.line_recessive.get()
    }

    fn set_timer(&self, after_us: u32) {
        self.timer_us.set(Some(after_us));
    }

    fn stop_timer(&self) {
        self.timer_us.set(None);
    }
}

fn noop_context() -> core::task::Context<'static> {
    use core::task::{RawWaker, RawWakerVTable, Waker};
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |_| RawWaker::new(core::ptr::null(), &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    static WAKER: Waker = unsafe {
        Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE))
    };
    core::task::Context::from_waker(&WAKER)
}

/// Walks the master through BREAK/PAUSE/SYNC; leaves it in Transfer state
/// with the sync byte echoed back.
fn run_framing(bus: &BusMaster<&TestUart>, uart: &TestUart) {
    // break timer
    assert_eq!(uart.timer_us.get(), Some(BREAK_US));
    bus.on_event(BusEvent::Timer);
    // pause timer
    assert_eq!(uart.timer_us.get(), Some(PAUSE_US));
    bus.on_event(BusEvent::Timer);
    // sync byte goes out, echo comes back
    assert!(uart.written().contains(&SYNC));
    bus.on_event(BusEvent::RxByte(SYNC));
}

#[test]
fn send_runs_break_sync_transfer() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut send = bus.send(&[0xA0, 0xB1]);
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    // the send triggers a break immediately
    assert!(uart.took().contains(&UartOp::Break(true)));

    run_framing(&bus, &uart);
    // first data byte goes out after sync
    assert_eq!(uart.written().last(), Some(&0xA0));

    // echo of each byte continues the transfer
    bus.on_event(BusEvent::RxByte(0xA0));
    assert_eq!(uart.written().last(), Some(&0xB1));
    bus.on_event(BusEvent::RxByte(0xB1));

    // quiet line finishes the frame
    bus.on_event(BusEvent::Timer);
    assert_eq!(Pin::new(&mut send).poll(&mut cx), Poll::Ready(true));
}

#[test]
fn receive_collects_frame_bytes() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut recv = bus.receive();
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // a node pulls the line low in idle: master answers with a break
    bus.on_event(BusEvent::RxByte(0x00));
    assert!(uart.took().contains(&UartOp::Break(true)));
    run_framing(&bus, &uart);

    for b in [0x11, 0x22, 0x33] {
        bus.on_event(BusEvent::RxByte(b));
    }
    bus.on_event(BusEvent::Timer);

    match Pin::new(&mut recv).poll(&mut cx) {
        Poll::Ready(frame) => assert_eq!(&frame[..], &[0x11, 0x22, 0x33]),
        Poll::Pending => panic!("receive did not complete"),
    }
}

#[test]
fn arbitration_loss_stops_tx_and_keeps_receiving() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut recv = bus.receive();
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // master wants to send 0x1F but a node sends 0x03 at the same time;
    // the wire shows the AND
    let mut send = bus.send(&[0x1F, 0x77]);
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    run_framing(&bus, &uart);
    uart.took();

    // read-back differs from what we wrote: we lost
    bus.on_event(BusEvent::RxByte(0x03));
    let ops = uart.took();
    assert!(ops.contains(&UartOp::StopTx));
    // no further data byte was written
    assert!(!ops.contains(&UartOp::Write(0x77)));

    // the surviving node's remaining bytes still land in the receive buffer
    bus.on_event(BusEvent::RxByte(0x44));
    bus.on_event(BusEvent::Timer);
    match Pin::new(&mut recv).poll(&mut cx) {
        Poll::Ready(frame) => assert_eq!(&frame[..], &[0x03, 0x44]),
        Poll::Pending => panic!("receive did not complete"),
    }
    // the send was not completed; it retries with the next break
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    assert!(uart.took().contains(&UartOp::Break(true)));
}

#[test]
fn dominant_line_during_own_byte_counts_as_loss() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut send = bus.send(&[0xFF]);
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    run_framing(&bus, &uart);
    uart.took();

    // the echo matches but the line is still held dominant
    uart.line_recessive.set(false);
    bus.on_event(BusEvent::RxByte(0xFF));
    assert!(uart.took().contains(&UartOp::StopTx));
}

#[test]
fn bad_sync_echo_restarts_break() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut send = bus.send(&[0x42]);
    let _ = Pin::new(&mut send).poll(&mut cx);
    // break, pause
    bus.on_event(BusEvent::Timer);
    bus.on_event(BusEvent::Timer);
    uart.took();

    // corrupted sync: the master starts over
    bus.on_event(BusEvent::RxByte(0x15));
    assert!(uart.took().contains(&UartOp::Break(true)));
}

#[test]
fn queued_send_starts_after_idle() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut s1 = bus.send(&[0x01]);
    let mut s2 = bus.send(&[0x02]);
    let _ = Pin::new(&mut s1).poll(&mut cx);
    let _ = Pin::new(&mut s2).poll(&mut cx);

    run_framing(&bus, &uart);
    bus.on_event(BusEvent::RxByte(0x01));
    bus.on_event(BusEvent::Timer);
    assert_eq!(Pin::new(&mut s1).poll(&mut cx), Poll::Ready(true));
    assert!(Pin::new(&mut s2).poll(&mut cx).is_pending());

    // the second send got its break at idle
    run_framing(&bus, &uart);
    assert_eq!(uart.written().last(), Some(&0x02));
    bus.on_event(BusEvent::RxByte(0x02));
    bus.on_event(BusEvent::Timer);
    assert_eq!(Pin::new(&mut s2).poll(&mut cx), Poll::Ready(true));
}

#[test]
fn dropping_send_cancels_it() {
    let uart = TestUart::new();
    let bus = BusMaster::new(&uart);
    let mut cx = noop_context();

    let mut send = bus.send(&[0x42]);
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    drop(send);
    uart.took();

    // the frame window passes with nothing to transmit
    run_framing(&bus, &uart);
    bus.on_event(BusEvent::Timer);
    // no new break afterwards
    assert!(!uart.took().contains(&UartOp::Break(true)));
}

proptest! {
    // Bus arbitration safety: however the two byte streams interleave, the
    // master either transmits its whole frame intact (wire equals its
    // frame) or stops transmitting at the first divergence and the other
    // sender's frame is received unmodified.
    #[test]
    fn arbitration_is_safe(
        master_frame in proptest::collection::vec(any::<u8>(), 1..8),
        node_frame in proptest::collection::vec(any::<u8>(), 1..8),
    ) {
        let uart = TestUart::new();
        let bus = BusMaster::new(&uart);
        let mut cx = noop_context();

        let mut recv = bus.receive();
        prop_assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
        let mut send = bus.send(&master_frame);
        prop_assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
        run_framing(&bus, &uart);
        uart.took();

        // simulate the open-collector wire byte by byte
        let len = master_frame.len().max(node_frame.len());
        let mut wire = Vec::new();
        let mut master_active = true;
        for i in 0..len {
            let m = if master_active && i < master_frame.len() {
                master_frame[i]
            } else {
                0xff // recessive idle
            };
            let n = if i < node_frame.len() { node_frame[i] } else { 0xff };
            let b = m & n;
            wire.push(b);
            bus.on_event(BusEvent::RxByte(b));
            if master_active && (b != m || i >= master_frame.len()) {
                master_active = false;
            }
            if master_active && i + 1 >= master_frame.len() {
                // master is done sending
                master_active = false;
            }
        }
        bus.on_event(BusEvent::Timer);

        let overlap = master_frame.len().min(node_frame.len());
        let divergence = (0..overlap)
            .find(|&i| master_frame[i] & node_frame[i] != master_frame[i]);

        match Pin::new(&mut send).poll(&mut cx) {
            Poll::Ready(ok) => {
                // completed: no divergence, and nobody kept talking after
                // the master's last byte
                prop_assert!(ok);
                prop_assert!(divergence.is_none());
                prop_assert!(node_frame.len() <= master_frame.len());
                // the wire carries the master's frame unmodified
                prop_assert_eq!(
                    &wire[..master_frame.len()],
                    &master_frame[..]
                );
            }
            Poll::Pending => {
                // aborted: either a divergence, or extra traffic after the
                // master's frame (treated as a collision)
                prop_assert!(
                    divergence.is_some()
                        || node_frame.len() > master_frame.len()
                );
                if let Some(d) = divergence {
                    // nothing was written past the divergence byte
                    let written = uart.written();
                    prop_assert!(written.len() <= d + 1);
                }
            }
        }
    }
}
