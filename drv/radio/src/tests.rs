// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::vec::Vec;

#[derive(Debug, Clone, PartialEq)]
enum Action {
    SetChannel(u8),
    EnableRx,
    Disable,
    StartReceive,
    StartCca,
    StopCca,
    Tx(Vec<u8>),
}

#[derive(Default)]
struct TestPhy {
    actions: RefCell<Vec<Action>>,
    micros: Cell<u32>,
    /// pending alarms: (channel, deadline, time it was set)
    alarms: RefCell<Vec<(Alarm, u32, u32)>>,
}

impl TestPhy {
    fn took(&self) -> Vec<Action> {
        self.actions.borrow_mut().drain(..).collect()
    }

    fn alarm(&self, which: Alarm) -> Option<u32> {
        self.alarms
            .borrow()
            .iter()
            .find(|(a, _, _)| *a == which)
            .map(|&(_, at, _)| at)
    }

    fn last_tx(&self) -> Option<Vec<u8>> {
        self.actions
            .borrow()
            .iter()
            .rev()
            .find_map(|a| match a {
                Action::Tx(frame) => Some(frame.clone()),
                _ => None,
            })
    }
}

impl Phy for &TestPhy {
    fn set_channel(&self, channel: u8) {
        self.actions.borrow_mut().push(Action::SetChannel(channel));
    }

    fn enable_rx(&self) {
        self.actions.borrow_mut().push(Action::EnableRx);
    }

    fn disable(&self) {
        self.actions.borrow_mut().push(Action::Disable);
    }

    fn start_receive(&self) {
        self.actions.borrow_mut().push(Action::StartReceive);
    }

    fn start_cca(&self) {
        self.actions.borrow_mut().push(Action::StartCca);
    }

    fn stop_cca(&self) {
        self.actions.borrow_mut().push(Action::StopCca);
    }

    fn start_tx(&self, frame: &[u8]) {
        self.actions.borrow_mut().push(Action::Tx(frame.to_vec()));
    }

    fn micros(&self) -> u32 {
        self.micros.get()
    }

    fn set_alarm(&self, alarm: Alarm, at: u32) {
        let mut alarms = self.alarms.borrow_mut();
        alarms.retain(|(a, _, _)| *a != alarm);
        alarms.push((alarm, at, self.micros.get()));
    }

    fn cancel_alarm(&self, alarm: Alarm) {
        self.alarms.borrow_mut().retain(|(a, _, _)| *a != alarm);
    }
}

/// Deterministic backoff randomness.
struct SeqRng(Cell<u8>);

impl SeqRng {
    fn zero() -> Self {
        Self(Cell::new(0))
    }
}

impl RandomSource for &SeqRng {
    fn next_u8(&self) -> u8 {
        let v = self.0.get();
        self.0.set(v.wrapping_add(1));
        v
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

fn fire_alarm(mac: &Mac<&TestPhy, &SeqRng>, phy: &TestPhy, which: Alarm) {
    let at = phy.alarm(which).expect("alarm not set");
    phy.micros.set(at);
    phy.alarms.borrow_mut().retain(|(a, _, _)| *a != which);
    mac.on_event(PhyEvent::Alarm(which));
}

fn data_frame(
    pan: u16,
    dst: u16,
    seq: u8,
    payload: &[u8],
    ack_request: bool,
) -> Vec<u8> {
    let mut fc = FrameControl::TYPE_DATA
        | FrameControl::DESTINATION_ADDRESSING_SHORT;
    if ack_request {
        fc |= FrameControl::ACKNOWLEDGE_REQUEST;
    }
    let mut v = vec![0u8];
    v.extend_from_slice(&fc.bits().to_le_bytes());
    v.push(seq);
    v.extend_from_slice(&pan.to_le_bytes());
    v.extend_from_slice(&dst.to_le_bytes());
    v.extend_from_slice(payload);
    v[0] = (v.len() - 1 + 2) as u8;
    v
}

fn started_mac<'a>(
    phy: &'a TestPhy,
    rng: &'a SeqRng,
) -> Mac<&'a TestPhy, &'a SeqRng> {
    let mac = Mac::new(phy, rng);
    mac.start(15);
    mac.on_event(PhyEvent::RxReady);
    mac.enable_receiver(true);
    phy.took();
    mac
}

#[test]
fn start_programs_channel_and_rx() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = Mac::new(&phy, &rng);
    mac.start(11);
    assert_eq!(
        phy.took(),
        vec![Action::SetChannel(11), Action::EnableRx]
    );
    // starting again while active does not ramp up twice
    mac.start(11);
    assert_eq!(phy.took(), vec![Action::SetChannel(11)]);
}

#[test]
fn send_without_ack_succeeds_after_one_backoff() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);

    let frame = data_frame(0x1234, 0x0001, 1, b"hi", false);
    let mut send = mac.send(0, &frame, SendFlags::empty());
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    assert!(phy.alarm(Alarm::Backoff).is_some());

    fire_alarm(&mac, &phy, Alarm::Backoff);
    assert!(phy.took().contains(&Action::StartCca));

    mac.on_event(PhyEvent::TxReady);
    let tx = phy.last_tx().expect("transmitted");
    assert_eq!(tx, &frame[..]);

    mac.on_event(PhyEvent::TxEnd);
    match Pin::new(&mut send).poll(&mut cx) {
        Poll::Ready(result) => assert_eq!(result, 1),
        Poll::Pending => panic!("send did not finish"),
    }
}

#[test]
fn send_with_ack_reports_success_on_ack() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_flags(0, ContextFlags::HANDLE_ACK);

    let frame = data_frame(0x1234, 0x0001, 7, b"hi", true);
    let mut send = mac.send(0, &frame, SendFlags::empty());
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());

    fire_alarm(&mac, &phy, Alarm::Backoff);
    mac.on_event(PhyEvent::TxReady);
    mac.on_event(PhyEvent::TxEnd);
    // now waiting for the acknowledge
    assert!(phy.alarm(Alarm::AckWait).is_some());
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());

    let ack = ack_frame(7, false);
    mac.on_event(PhyEvent::CrcOk {
        frame: &ack,
        lqi: 200,
        timestamp: phy.micros.get(),
    });
    match Pin::new(&mut send).poll(&mut cx) {
        Poll::Ready(result) => assert_eq!(result, 1),
        Poll::Pending => panic!("ack did not finish the send"),
    }
}

#[test]
fn missing_ack_retries_then_fails() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_flags(0, ContextFlags::HANDLE_ACK);

    let frame = data_frame(0x1234, 0x0001, 7, b"hi", true);
    let mut send = mac.send(0, &frame, SendFlags::empty());
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());

    let mut transmissions = 0;
    // three full attempts, each ending in an ack-wait timeout
    for _ in 0..MAX_ACK_RETRY_COUNT {
        fire_alarm(&mac, &phy, Alarm::Backoff);
        mac.on_event(PhyEvent::TxReady);
        mac.on_event(PhyEvent::TxEnd);
        transmissions += 1;
        assert!(phy.alarm(Alarm::AckWait).is_some());
        fire_alarm(&mac, &phy, Alarm::AckWait);
    }
    assert_eq!(transmissions, 3);
    match Pin::new(&mut send).poll(&mut cx) {
        Poll::Ready(result) => assert_eq!(result, 0),
        Poll::Pending => panic!("send did not fail"),
    }
}

#[test]
fn receive_filter_passes_matching_short_address() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_pan(0, 0x1234);
    mac.set_short_address(0, 0x0042);
    mac.set_flags(0, ContextFlags::PASS_DEST_SHORT);

    let mut cx = noop_context();
    let mut recv = mac.receive(0);
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // wrong pan: filtered
    let other = data_frame(0x9999, 0x0042, 1, b"x", false);
    mac.on_event(PhyEvent::CrcOk {
        frame: &other,
        lqi: 10,
        timestamp: 1000,
    });
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // matching pan and address: delivered with lqi and timestamp
    let frame = data_frame(0x1234, 0x0042, 2, b"yo", false);
    mac.on_event(PhyEvent::CrcOk {
        frame: &frame,
        lqi: 77,
        timestamp: 0x01020304,
    });
    match Pin::new(&mut recv).poll(&mut cx) {
        Poll::Ready(packet) => {
            assert_eq!(packet[0], frame[0]);
            let payload_len = frame[0] as usize - 2;
            assert_eq!(&packet[1..1 + payload_len], &frame[1..]);
            assert_eq!(packet[1 + payload_len], 77);
            assert_eq!(
                &packet[1 + payload_len + 1..1 + payload_len + 5],
                &0x01020304u32.to_le_bytes()
            );
        }
        Poll::Pending => panic!("packet not delivered"),
    }
}

#[test]
fn broadcast_passes_and_sequence_suppression_rejects() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_pan(0, 0x1234);
    mac.set_short_address(0, 0x0042);
    mac.set_flags(0, ContextFlags::PASS_DEST_SHORT);

    let mut cx = noop_context();
    let mut recv = mac.receive(0);
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // broadcast destination passes
    let frame = data_frame(0xffff, 0xffff, 3, b"all", false);
    mac.on_event(PhyEvent::CrcOk {
        frame: &frame,
        lqi: 1,
        timestamp: 0,
    });
    assert!(Pin::new(&mut recv).poll(&mut cx).is_ready());

    // suppressed sequence number is rejected
    let mut recv = mac.receive(0);
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
    let mut frame = data_frame(0x1234, 0x0042, 0, b"x", false);
    let fc = frame_control(&frame)
        | FrameControl::SEQUENCE_NUMBER_SUPPRESSION;
    frame[1] = fc.bits() as u8;
    frame[2] = (fc.bits() >> 8) as u8;
    mac.on_event(PhyEvent::CrcOk {
        frame: &frame,
        lqi: 1,
        timestamp: 0,
    });
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
}

#[test]
fn ack_requested_frame_schedules_ack() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_pan(0, 0x1234);
    mac.set_short_address(0, 0x0042);
    mac.set_flags(
        0,
        ContextFlags::PASS_DEST_SHORT | ContextFlags::HANDLE_ACK,
    );

    let frame = data_frame(0x1234, 0x0042, 9, b"x", true);
    mac.on_event(PhyEvent::CrcOk {
        frame: &frame,
        lqi: 1,
        timestamp: 5000,
    });

    // ack goes out after the turnaround time
    assert_eq!(
        phy.alarm(Alarm::AckTurnaround),
        Some(5000 + 12 * 16)
    );
    fire_alarm(&mac, &phy, Alarm::AckTurnaround);
    assert_eq!(phy.last_tx().unwrap(), ack_frame(9, false).to_vec());
}

#[test]
fn data_request_releases_held_send_with_frame_pending() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);
    mac.set_pan(0, 0x1234);
    mac.set_short_address(0, 0x0042);
    mac.set_flags(
        0,
        ContextFlags::PASS_DEST_SHORT | ContextFlags::HANDLE_ACK,
    );

    // a packet for node 0x0201 held until it polls
    let held = data_frame(0x1234, 0x0201, 4, b"held", false);
    let mut send =
        mac.send(0, &held, SendFlags::AWAIT_DATA_REQUEST);
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    // not selected for transmission while held
    assert!(phy.alarm(Alarm::Backoff).is_none());

    // the node polls with a data request
    let fc = FrameControl::TYPE_COMMAND
        | FrameControl::PAN_ID_COMPRESSION
        | FrameControl::DESTINATION_ADDRESSING_SHORT
        | FrameControl::SOURCE_ADDRESSING_FLAG
        | FrameControl::ACKNOWLEDGE_REQUEST;
    let mut request = vec![0u8];
    request.extend_from_slice(&fc.bits().to_le_bytes());
    request.push(17); // seq
    request.extend_from_slice(&0x1234u16.to_le_bytes());
    request.extend_from_slice(&0x0042u16.to_le_bytes()); // dst: us
    request.extend_from_slice(&0x0201u16.to_le_bytes()); // src
    request.push(COMMAND_DATA_REQUEST);
    request[0] = (request.len() - 1 + 2) as u8;

    let mut recv = mac.receive(0);
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
    mac.on_event(PhyEvent::CrcOk {
        frame: &request,
        lqi: 1,
        timestamp: 9000,
    });

    // the data request itself is not delivered to the context
    assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

    // the ack carries the frame-pending bit
    fire_alarm(&mac, &phy, Alarm::AckTurnaround);
    assert_eq!(phy.last_tx().unwrap(), ack_frame(17, true).to_vec());

    // after the ack the held packet is transmitted
    mac.on_event(PhyEvent::TxEnd);
    mac.on_event(PhyEvent::RxReady);
    assert!(phy.alarm(Alarm::Backoff).is_some());
    fire_alarm(&mac, &phy, Alarm::Backoff);
    mac.on_event(PhyEvent::TxReady);
    assert_eq!(phy.last_tx().unwrap(), held);
}

#[test]
fn stop_fails_pending_sends() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);

    let frame = data_frame(0x1234, 0x0001, 1, b"hi", false);
    let mut send = mac.send(0, &frame, SendFlags::empty());
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());

    mac.stop();
    match Pin::new(&mut send).poll(&mut cx) {
        Poll::Ready(result) => assert_eq!(result, 0),
        Poll::Pending => panic!("stop did not fail the send"),
    }
}

#[test]
fn dropping_send_cancels_backoff() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);

    let frame = data_frame(0x1234, 0x0001, 1, b"hi", false);
    let mut send = mac.send(0, &frame, SendFlags::empty());
    let mut cx = noop_context();
    assert!(Pin::new(&mut send).poll(&mut cx).is_pending());
    assert!(phy.alarm(Alarm::Backoff).is_some());

    drop(send);
    assert!(phy.alarm(Alarm::Backoff).is_none());

    // a second queued send takes over
    let frame2 = data_frame(0x1234, 0x0002, 2, b"yo", false);
    let mut send2 = mac.send(0, &frame2, SendFlags::empty());
    assert!(Pin::new(&mut send2).poll(&mut cx).is_pending());
    assert!(phy.alarm(Alarm::Backoff).is_some());
}

#[test]
fn sends_round_robin_across_contexts() {
    let phy = TestPhy::default();
    let rng = SeqRng::zero();
    let mac = started_mac(&phy, &rng);

    let f0a = data_frame(0x1111, 0x0001, 1, b"a", false);
    let f0b = data_frame(0x1111, 0x0001, 2, b"b", false);
    let f1 = data_frame(0x2222, 0x0002, 3, b"c", false);
    let mut cx = noop_context();
    let mut s0a = mac.send(0, &f0a, SendFlags::empty());
    let mut s0b = mac.send(0, &f0b, SendFlags::empty());
    let mut s1 = mac.send(1, &f1, SendFlags::empty());
    let _ = Pin::new(&mut s0a).poll(&mut cx);
    let _ = Pin::new(&mut s0b).poll(&mut cx);
    let _ = Pin::new(&mut s1).poll(&mut cx);

    let complete = |mac: &Mac<&TestPhy, &SeqRng>| {
        fire_alarm(mac, &phy, Alarm::Backoff);
        mac.on_event(PhyEvent::TxReady);
        let tx = phy.last_tx().unwrap();
        mac.on_event(PhyEvent::TxEnd);
        mac.on_event(PhyEvent::RxReady);
        tx
    };

    // context 0 already holds the cursor, so after its first packet the
    // other context gets a turn before context 0's backlog continues
    assert_eq!(complete(&mac), f0a);
    assert_eq!(complete(&mac), f1);
    assert_eq!(complete(&mac), f0b);
}

proptest! {
    // Under any schedule of CCA failures the sender gives up after at most
    // three backoffs, and the total backoff time stays within
    // 3 * 2^5 * 20 symbols.
    #[test]
    fn backoff_time_is_bounded(seed in proptest::collection::vec(any::<u8>(), 8)) {
        let phy = TestPhy::default();
        let seeded = SeededRng {
            bytes: seed,
            next: Cell::new(0),
        };
        let mac = Mac::new(&phy, &seeded);
        mac.start(15);
        mac.on_event(PhyEvent::RxReady);
        phy.took();

        let frame = data_frame(0x1234, 0x0001, 1, b"hi", false);
        let mut send = mac.send(0, &frame, SendFlags::empty());
        let mut cx = noop_context();
        prop_assert!(Pin::new(&mut send).poll(&mut cx).is_pending());

        let mut total_backoff_us = 0u64;
        let mut attempts = 0;
        while let Some(at) = phy.alarm(Alarm::Backoff) {
            let set_at = phy
                .alarms
                .borrow()
                .iter()
                .find(|(a, _, _)| *a == Alarm::Backoff)
                .map(|&(_, _, t)| t)
                .unwrap();
            total_backoff_us += at.wrapping_sub(set_at) as u64;
            phy.micros.set(at);
            phy.alarms.borrow_mut().retain(|(a, _, _)| *a != Alarm::Backoff);
            mac.on_event(PhyEvent::Alarm(Alarm::Backoff));
            if phy.took().contains(&Action::StartCca) {
                attempts += 1;
                mac.on_event(PhyEvent::CcaBusy);
            }
        }

        prop_assert_eq!(attempts, 3);
        match Pin::new(&mut send).poll(&mut cx) {
            Poll::Ready(result) => prop_assert_eq!(result, 0),
            Poll::Pending => prop_assert!(false, "send still pending"),
        }
        prop_assert!(total_backoff_us <= (3 * 32 * 20 * 16) as u64);
    }
}

struct SeededRng {
    bytes: Vec<u8>,
    next: Cell<usize>,
}

impl RandomSource for &SeededRng {
    fn next_u8(&self) -> u8 {
        let i = self.next.get();
        self.next.set(i + 1);
        self.bytes[i % self.bytes.len()]
    }
}
