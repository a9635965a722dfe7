// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IEEE 802.15.4 MAC driver.
//!
//! One PHY is shared by up to [`CONTEXT_COUNT`] *virtual radios*. Each
//! context has its own PAN id, short address and filter flags, plus receive
//! and send wait lists; a single 64 bit long address applies to all of them.
//!
//! The MAC is a state machine over [`PhyEvent`]s: the hardware glue (or the
//! emulator, or a test) feeds events in from event-loop context, and the MAC
//! reacts by driving the [`Phy`]. Sending runs CSMA/CA: random backoff with
//! exponent 3..5 and at most three attempts, clear channel assessment,
//! optional acknowledge wait with up to three full retries. The send result
//! is 0 on failure, or 1 + the number of backoffs used on success.
//!
//! Contexts take fair turns sending (round-robin cursor); receive packets
//! pass a per-context filter and are handed to the context's oldest waiting
//! receive. Dropping a send future cancels the operation, including an
//! in-flight one: CCA and timers are stopped and the result slot detached.

#![cfg_attr(target_os = "none", no_std)]

mod frame;

pub use frame::*;

use bitflags::bitflags;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use exec::{Barrier, BarrierWait};
use ringbuf::{ringbuf, ringbuf_entry};

/// Number of virtual radios.
pub const CONTEXT_COUNT: usize = 4;

// per-packet pass flags are a u8 bitmask
static_assertions::const_assert!(CONTEXT_COUNT <= 8);

/// Maximum payload length, not counting the 2-byte CRC.
pub const MAX_PAYLOAD_LENGTH: usize = 125;

/// Receive packets carry LQI and a 4-byte timestamp behind the payload.
pub const RECEIVE_EXTRA_LENGTH: usize = 1 + 4;

pub const PACKET_SIZE: usize =
    1 + MAX_PAYLOAD_LENGTH + RECEIVE_EXTRA_LENGTH;

/// A packet buffer: PHY length (payload + 2 for CRC), payload, extra data.
pub type Packet = [u8; PACKET_SIZE];

const SYMBOL_US: u32 = 16;
const ACK_TURNAROUND_US: u32 = 12 * SYMBOL_US;
const ACK_WAIT_US: u32 = 54 * SYMBOL_US;
const MAX_SIFS_LENGTH: u8 = 18;
const MIN_SIFS_US: u32 = 12 * SYMBOL_US;
const MIN_LIFS_US: u32 = 40 * SYMBOL_US;
const MIN_BACKOFF_EXPONENT: u32 = 3;
const MAX_BACKOFF_EXPONENT: u32 = 5;
const MAX_BACKOFF_COUNT: u32 = 3;
const UNIT_BACKOFF_US: u32 = 20 * SYMBOL_US;
const MAX_ACK_RETRY_COUNT: u32 = 3;
const RECEIVE_QUEUE_LENGTH: usize = 8;
const SENDS_PER_CONTEXT: usize = 4;

bitflags! {
    /// Per-context receive filter and configuration flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct ContextFlags: u8 {
        const PASS_ALL = 1;
        const PASS_TYPE_BEACON = 2;
        const PASS_DEST_SHORT = 4;
        const PASS_TYPE_DATA_DEST_SHORT = 8;
        const PASS_DEST_LONG = 16;
        const HANDLE_ACK = 32;
    }
}

bitflags! {
    /// Per-send flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Hold the packet until the destination polls with a data request.
        const AWAIT_DATA_REQUEST = 1;
    }
}

/// Timer channels the MAC multiplexes on the PHY's alarm facility.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alarm {
    AckTurnaround,
    AckWait,
    Backoff,
}

/// Events the hardware glue feeds into [`Mac::on_event`], always from
/// event-loop context.
#[derive(Debug)]
pub enum PhyEvent<'a> {
    /// Receiver ramped up and idle.
    RxReady,
    /// CCA found the channel clear and the transmitter is ready.
    TxReady,
    /// CCA found the channel busy.
    CcaBusy,
    /// A frame arrived with a good CRC. `frame[0]` is the PHY length.
    CrcOk {
        frame: &'a [u8],
        lqi: u8,
        timestamp: u32,
    },
    /// A frame arrived with a bad CRC.
    CrcError,
    /// A transmission finished.
    TxEnd,
    /// The radio reached the disabled state.
    Disabled,
    Alarm(Alarm),
}

/// Operations the MAC needs from the radio hardware.
pub trait Phy {
    fn set_channel(&self, channel: u8);
    /// Ramp up the receive chain; reports `RxReady`.
    fn enable_rx(&self);
    /// Tear everything down; reports `Disabled`.
    fn disable(&self);
    /// Start baseband decoding; reports `CrcOk`/`CrcError` per frame.
    fn start_receive(&self);
    /// Start clear channel assessment; reports `TxReady` or `CcaBusy`.
    fn start_cca(&self);
    fn stop_cca(&self);
    /// Transmit one frame (length byte plus payload); reports `TxEnd`.
    fn start_tx(&self, frame: &[u8]);
    /// Free-running microsecond timestamp.
    fn micros(&self) -> u32;
    /// One-shot alarm at an absolute microsecond time.
    fn set_alarm(&self, alarm: Alarm, at: u32);
    fn cancel_alarm(&self, alarm: Alarm);
}

/// Backoff randomness; the RNG pool provides this in firmware.
pub trait RandomSource {
    fn next_u8(&self) -> u8;
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum SendState {
    Idle,
    Backoff,
    Cca,
    Transmit,
    AwaitAck,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum TxKind {
    Ack,
    Data,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum OpState {
    Queued,
    Active,
    Done(u8),
}

struct SendOp {
    key: u32,
    data: [u8; 1 + MAX_PAYLOAD_LENGTH],
    flags: SendFlags,
    state: OpState,
    waker: Option<Waker>,
}

/// Ordered removal; per-context send order is part of the contract, so
/// `swap_remove` is out.
fn remove_send_op(
    sends: &mut heapless::Vec<SendOp, SENDS_PER_CONTEXT>,
    pos: usize,
) {
    for i in pos..sends.len() - 1 {
        let next = core::mem::replace(
            &mut sends[i + 1],
            SendOp {
                key: 0,
                data: [0; 1 + MAX_PAYLOAD_LENGTH],
                flags: SendFlags::empty(),
                state: OpState::Done(0),
                waker: None,
            },
        );
        sends[i] = next;
    }
    sends.truncate(sends.len() - 1);
}

struct ContextState {
    pan: u16,
    short_address: u16,
    flags: ContextFlags,
    sends: heapless::Vec<SendOp, SENDS_PER_CONTEXT>,
}

impl ContextState {
    /// The receive filter: a packet passes when any enabled rule matches.
    fn filter(&self, packet: &[u8], long_address: u64) -> bool {
        let flags = self.flags;
        if flags.contains(ContextFlags::PASS_ALL) {
            return true;
        }

        let fc = frame_control(packet);

        // reject frames with no sequence number
        if fc.contains(FrameControl::SEQUENCE_NUMBER_SUPPRESSION) {
            return false;
        }

        if flags.contains(ContextFlags::PASS_TYPE_BEACON)
            && frame_type(fc) == FrameControl::TYPE_BEACON
        {
            return true;
        }

        if fc.contains(FrameControl::DESTINATION_ADDRESSING_FLAG) {
            if packet.len() < 8 {
                return false;
            }
            let pan = destination_pan(packet);
            if pan != BROADCAST && pan != self.pan {
                return false;
            }

            if !fc.contains(FrameControl::DESTINATION_ADDRESSING_LONG_FLAG)
            {
                let pass = flags.contains(ContextFlags::PASS_DEST_SHORT)
                    || (flags
                        .contains(ContextFlags::PASS_TYPE_DATA_DEST_SHORT)
                        && frame_type(fc) == FrameControl::TYPE_DATA);
                if pass {
                    let short = destination_short(packet);
                    if short == BROADCAST || short == self.short_address {
                        return true;
                    }
                }
            } else if flags.contains(ContextFlags::PASS_DEST_LONG)
                && packet.len() >= 14
                && destination_long(packet) == long_address
            {
                return true;
            }
        }

        false
    }

    /// Checks for a held send matching a data request's source; clears its
    /// hold flag so it becomes eligible for transmission.
    fn take_pending(&mut self, pan: u16, address: &[u8]) -> bool {
        for op in self.sends.iter_mut() {
            if op.state != OpState::Queued
                || !op.flags.contains(SendFlags::AWAIT_DATA_REQUEST)
            {
                continue;
            }
            if destination_pan(&op.data) != pan {
                continue;
            }
            let fc = frame_control(&op.data)
                & (FrameControl::SEQUENCE_NUMBER_SUPPRESSION
                    | FrameControl::DESTINATION_ADDRESSING_MASK);
            let mode = if address.len() == 2 {
                FrameControl::DESTINATION_ADDRESSING_SHORT
            } else {
                FrameControl::DESTINATION_ADDRESSING_LONG
            };
            if fc != mode {
                continue;
            }
            if &op.data[6..6 + address.len()] == address {
                op.flags.remove(SendFlags::AWAIT_DATA_REQUEST);
                return true;
            }
        }
        false
    }
}

struct Received {
    packet: Packet,
    pass_flags: u8,
}

struct MacState {
    active: bool,
    receiver_enabled: bool,
    send_state: SendState,
    tx_kind: Option<TxKind>,
    tx_wants_ack: bool,
    send_index: usize,
    send_key: Option<(usize, u32)>,
    backoff_exponent: u32,
    backoff_count: u32,
    ack_retry_count: u32,
    ifs_us: u32,
    last_end_us: u32,
    ack_pending: Option<[u8; 4]>,
    next_op_key: u32,
    rx_queue: heapless::Deque<Received, RECEIVE_QUEUE_LENGTH>,
    contexts: [ContextState; CONTEXT_COUNT],
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Start(u8),
    Stop,
    CcaBusy,
    SendFailed,
    Sent(u8),
    AckTimeout(u32),
    RxPassed(u8),
    RxDropped,
}

ringbuf!(Trace, 32, Trace::None);

pub struct Mac<P: Phy, R: RandomSource> {
    phy: P,
    random: R,
    long_address: Cell<u64>,
    st: RefCell<MacState>,
    rx_barriers: [Barrier<Packet>; CONTEXT_COUNT],
}

impl<P: Phy, R: RandomSource> Mac<P, R> {
    pub fn new(phy: P, random: R) -> Self {
        Self {
            phy,
            random,
            long_address: Cell::new(0),
            st: RefCell::new(MacState {
                active: false,
                receiver_enabled: false,
                send_state: SendState::Idle,
                tx_kind: None,
                tx_wants_ack: false,
                send_index: 0,
                send_key: None,
                backoff_exponent: MIN_BACKOFF_EXPONENT,
                backoff_count: 0,
                ack_retry_count: 0,
                ifs_us: 0,
                last_end_us: 0,
                ack_pending: None,
                next_op_key: 0,
                rx_queue: heapless::Deque::new(),
                contexts: core::array::from_fn(|_| ContextState {
                    pan: BROADCAST,
                    short_address: BROADCAST,
                    flags: ContextFlags::empty(),
                    sends: heapless::Vec::new(),
                }),
            }),
            rx_barriers: core::array::from_fn(|_| Barrier::new()),
        }
    }

    // configuration ------------------------------------------------------

    pub fn set_long_address(&self, address: u64) {
        self.long_address.set(address);
    }

    pub fn long_address(&self) -> u64 {
        self.long_address.get()
    }

    pub fn set_pan(&self, index: usize, pan: u16) {
        self.st.borrow_mut().contexts[index].pan = pan;
    }

    pub fn set_short_address(&self, index: usize, address: u16) {
        self.st.borrow_mut().contexts[index].short_address = address;
    }

    pub fn set_flags(&self, index: usize, flags: ContextFlags) {
        self.st.borrow_mut().contexts[index].flags = flags;
    }

    // control ------------------------------------------------------------

    /// Enables the receive chain on `channel` (10..=26). Baseband decoding
    /// starts once `enable_receiver(true)` is called as well.
    pub fn start(&self, channel: u8) {
        debug_assert!((10..=26).contains(&channel));
        ringbuf_entry!(Trace::Start(channel));
        self.phy.set_channel(channel);
        let mut st = self.st.borrow_mut();
        if !st.active {
            st.active = true;
            drop(st);
            self.phy.enable_rx();
        }
    }

    /// Tears the radio down and fails every pending send.
    pub fn stop(&self) {
        ringbuf_entry!(Trace::Stop);
        self.phy.cancel_alarm(Alarm::AckTurnaround);
        self.phy.cancel_alarm(Alarm::AckWait);
        self.phy.cancel_alarm(Alarm::Backoff);
        self.phy.disable();

        let mut st = self.st.borrow_mut();
        st.active = false;
        st.receiver_enabled = false;
        st.send_state = SendState::Idle;
        st.tx_kind = None;
        st.ack_pending = None;
        st.send_key = None;
        st.rx_queue.clear();
        for context in &mut st.contexts {
            for op in context.sends.iter_mut() {
                op.state = OpState::Done(0);
                if let Some(waker) = op.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    /// Enables or disables baseband decoding.
    pub fn enable_receiver(&self, enable: bool) {
        let mut st = self.st.borrow_mut();
        st.receiver_enabled = enable;
        let start = enable && st.active && st.tx_kind.is_none();
        drop(st);
        if start {
            self.phy.start_receive();
        }
    }

    // wait lists ---------------------------------------------------------

    /// Waits for the next packet passing `index`'s filter.
    pub fn receive(&self, index: usize) -> BarrierWait<'_, Packet> {
        self.rx_barriers[index].wait()
    }

    /// Queues `packet` (length byte plus payload, length including CRC) on
    /// context `index`. The future completes with 0 on failure or 1 + the
    /// number of backoffs used on success.
    pub fn send<'a>(
        &'a self,
        index: usize,
        packet: &[u8],
        flags: SendFlags,
    ) -> Send<'a, P, R> {
        let mut st = self.st.borrow_mut();
        let key = st.next_op_key;
        st.next_op_key = st.next_op_key.wrapping_add(1);

        let mut op = SendOp {
            key,
            data: [0; 1 + MAX_PAYLOAD_LENGTH],
            flags,
            state: OpState::Queued,
            waker: None,
        };
        let len = packet.len().min(1 + MAX_PAYLOAD_LENGTH);
        op.data[..len].copy_from_slice(&packet[..len]);

        let key = if st.contexts[index].sends.push(op).is_err() {
            // queue full: fail immediately
            None
        } else {
            Some(key)
        };

        if key.is_some() && st.send_state == SendState::Idle {
            self.select_for_send(&mut st);
        }
        drop(st);

        Send {
            mac: self,
            index,
            key,
        }
    }

    // event handling -----------------------------------------------------

    pub fn on_event(&self, event: PhyEvent<'_>) {
        match event {
            PhyEvent::RxReady => {
                let mut st = self.st.borrow_mut();
                if st.receiver_enabled {
                    self.phy.start_receive();
                }
                if st.send_state == SendState::Idle {
                    self.select_for_send(&mut st);
                }
            }
            PhyEvent::CcaBusy => {
                ringbuf_entry!(Trace::CcaBusy);
                let mut st = self.st.borrow_mut();
                self.backoff(&mut st);
            }
            PhyEvent::TxReady => {
                let mut st = self.st.borrow_mut();
                if st.ack_pending.is_some() {
                    // a pending acknowledge overrides the data send
                    self.backoff(&mut st);
                } else if st.send_state == SendState::Cca
                    && st.send_key.is_some()
                {
                    st.send_state = SendState::Transmit;
                    st.tx_kind = Some(TxKind::Data);
                    let len = (1 + st.send_packet_len().saturating_sub(2))
                        .min(1 + MAX_PAYLOAD_LENGTH);
                    let frame: heapless::Vec<u8, { 1 + MAX_PAYLOAD_LENGTH }> =
                        heapless::Vec::from_slice(
                            &st.active_send_data()[..len],
                        )
                        .unwrap_or_default();
                    drop(st);
                    self.phy.start_tx(&frame);
                }
            }
            PhyEvent::CrcOk {
                frame,
                lqi,
                timestamp,
            } => self.on_crc_ok(frame, lqi, timestamp),
            PhyEvent::CrcError => {
                let mut st = self.st.borrow_mut();
                // worst case, the length is unknown
                st.ifs_us = MIN_LIFS_US;
                st.last_end_us = self.phy.micros();
                let restart = st.receiver_enabled && st.tx_kind.is_none();
                drop(st);
                if restart {
                    self.phy.start_receive();
                }
            }
            PhyEvent::TxEnd => self.on_tx_end(),
            PhyEvent::Disabled => {
                let st = self.st.borrow();
                if st.active {
                    drop(st);
                    self.phy.enable_rx();
                }
            }
            PhyEvent::Alarm(Alarm::AckTurnaround) => {
                let mut st = self.st.borrow_mut();
                if let Some(ack) = st.ack_pending.take() {
                    if st.send_state == SendState::Cca {
                        // abort the data attempt, the ack goes first
                        self.phy.stop_cca();
                        st.send_state = SendState::Backoff;
                    }
                    st.tx_kind = Some(TxKind::Ack);
                    drop(st);
                    self.phy.start_tx(&ack);
                }
            }
            PhyEvent::Alarm(Alarm::AckWait) => {
                let mut st = self.st.borrow_mut();
                if st.send_state != SendState::AwaitAck {
                    return;
                }
                ringbuf_entry!(Trace::AckTimeout(st.ack_retry_count));
                if st.ack_retry_count < MAX_ACK_RETRY_COUNT {
                    st.ack_retry_count += 1;
                    self.start_backoff(&mut st);
                } else {
                    self.finish_send(&mut st, 0);
                    self.select_for_send(&mut st);
                }
            }
            PhyEvent::Alarm(Alarm::Backoff) => {
                let mut st = self.st.borrow_mut();
                if st.send_state != SendState::Backoff
                    || st.tx_kind.is_some()
                {
                    return;
                }
                // respect inter-frame spacing relative to the last traffic
                let elapsed =
                    self.phy.micros().wrapping_sub(st.last_end_us);
                if elapsed >= st.ifs_us {
                    st.send_state = SendState::Cca;
                    drop(st);
                    self.phy.start_cca();
                } else {
                    self.backoff(&mut st);
                }
            }
        }
    }

    fn on_crc_ok(&self, frame: &[u8], lqi: u8, timestamp: u32) {
        if frame.len() < 4 {
            return;
        }
        let mut st = self.st.borrow_mut();
        let length = frame[0];
        st.ifs_us = if length <= MAX_SIFS_LENGTH {
            MIN_SIFS_US
        } else {
            MIN_LIFS_US
        };
        st.last_end_us = timestamp;

        let fc = frame_control(frame);

        // a previously sent packet may be waiting for this acknowledge
        if st.send_state == SendState::AwaitAck
            && frame_type(fc) == FrameControl::TYPE_ACK
            && sequence_number(frame) == st.active_send_data()[3]
        {
            self.phy.cancel_alarm(Alarm::AckWait);
            self.phy.cancel_alarm(Alarm::Backoff);
            let result = st.backoff_count as u8;
            self.finish_send(&mut st, result);
            self.select_for_send(&mut st);
        }

        // run every context's filter and work out acknowledge handling
        let mut pass_flags = 0u8;
        let mut ack = false;
        let mut frame_pending = false;
        let long_address = self.long_address.get();
        let data_request = parse_data_request(frame);
        for (i, context) in st.contexts.iter_mut().enumerate() {
            if context.flags.is_empty()
                || !context.filter(frame, long_address)
            {
                continue;
            }
            pass_flags |= 1 << i;

            if context.flags.contains(ContextFlags::HANDLE_ACK)
                && fc.contains(FrameControl::ACKNOWLEDGE_REQUEST)
            {
                ack = true;
                if let Some(req) = &data_request {
                    if context.take_pending(req.pan, req.address) {
                        frame_pending = true;
                    }
                    // data request frames are not delivered
                    pass_flags &= !(1 << i);
                }
            }
        }

        if ack {
            st.ack_pending =
                Some(ack_frame(sequence_number(frame), frame_pending));
            self.phy.set_alarm(
                Alarm::AckTurnaround,
                timestamp.wrapping_add(ACK_TURNAROUND_US),
            );
        }

        if pass_flags != 0 {
            ringbuf_entry!(Trace::RxPassed(pass_flags));
            let mut packet: Packet = [0; PACKET_SIZE];
            let payload_len = (length as usize)
                .saturating_sub(2)
                .min(MAX_PAYLOAD_LENGTH)
                .min(frame.len().saturating_sub(1));
            packet[0] = length;
            packet[1..1 + payload_len]
                .copy_from_slice(&frame[1..1 + payload_len]);
            packet[1 + payload_len] = lqi;
            packet[1 + payload_len + 1..1 + payload_len + 5]
                .copy_from_slice(&timestamp.to_le_bytes());

            // bounded queue, oldest packet goes first
            if st.rx_queue.is_full() {
                ringbuf_entry!(Trace::RxDropped);
                st.rx_queue.pop_front();
            }
            st.rx_queue
                .push_back(Received { packet, pass_flags })
                .ok();
            self.drain_rx(&mut st);
        }

        // continue receiving
        let restart = st.receiver_enabled && st.tx_kind.is_none();
        drop(st);
        if restart {
            self.phy.start_receive();
        }
    }

    fn on_tx_end(&self) {
        let mut st = self.st.borrow_mut();
        st.last_end_us = self.phy.micros();
        match st.tx_kind.take() {
            Some(TxKind::Ack) => {
                // an aborted data attempt resumes after the acknowledge
                if st.send_state == SendState::Backoff {
                    self.phy.set_alarm(
                        Alarm::Backoff,
                        st.last_end_us.wrapping_add(UNIT_BACKOFF_US),
                    );
                }
            }
            Some(TxKind::Data) => {
                let length = st.send_packet_len() as u8;
                st.ifs_us = if length <= MAX_SIFS_LENGTH {
                    MIN_SIFS_US
                } else {
                    MIN_LIFS_US
                };
                if st.send_key.is_none() {
                    // cancelled while in flight
                    st.send_state = SendState::Idle;
                    self.select_for_send(&mut st);
                } else if st.tx_wants_ack {
                    st.send_state = SendState::AwaitAck;
                    self.phy.set_alarm(
                        Alarm::AckWait,
                        st.last_end_us.wrapping_add(ACK_WAIT_US),
                    );
                } else {
                    let result = st.backoff_count as u8;
                    self.finish_send(&mut st, result);
                    self.select_for_send(&mut st);
                }
            }
            None => {}
        }
        let active = st.active;
        drop(st);
        if active {
            self.phy.enable_rx();
        }
    }

    // send machinery -----------------------------------------------------

    /// Picks the next queued send, round-robin across contexts.
    fn select_for_send(&self, st: &mut MacState) {
        if !st.active || st.send_state != SendState::Idle {
            return;
        }
        let mut index = st.send_index;
        for _ in 0..CONTEXT_COUNT {
            index = (index + 1) % CONTEXT_COUNT;
            let flags = st.contexts[index].flags;
            let found = st.contexts[index].sends.iter_mut().find(|op| {
                op.state == OpState::Queued
                    && !op.flags.contains(SendFlags::AWAIT_DATA_REQUEST)
            });
            if let Some(op) = found {
                op.state = OpState::Active;
                let key = op.key;
                let requests_ack = frame_control(&op.data)
                    .contains(FrameControl::ACKNOWLEDGE_REQUEST);
                st.send_index = index;
                st.send_key = Some((index, key));
                st.tx_wants_ack = requests_ack
                    && flags.contains(ContextFlags::HANDLE_ACK);
                st.ack_retry_count = 1;
                self.start_backoff(st);
                return;
            }
        }
    }

    fn start_backoff(&self, st: &mut MacState) {
        st.backoff_exponent = MIN_BACKOFF_EXPONENT;
        st.backoff_count = 0;
        self.backoff(st);
    }

    fn backoff(&self, st: &mut MacState) {
        if st.backoff_count >= MAX_BACKOFF_COUNT {
            ringbuf_entry!(Trace::SendFailed);
            self.phy.cancel_alarm(Alarm::Backoff);
            self.finish_send(st, 0);
            self.select_for_send(st);
            return;
        }

        let range = (1u32 << st.backoff_exponent) - 1;
        let backoff = (self.random.next_u8() as u32 & range) + 1;
        st.backoff_exponent =
            (st.backoff_exponent + 1).min(MAX_BACKOFF_EXPONENT);
        st.backoff_count += 1;
        st.send_state = SendState::Backoff;
        self.phy.set_alarm(
            Alarm::Backoff,
            self.phy
                .micros()
                .wrapping_add(backoff * UNIT_BACKOFF_US),
        );
    }

    fn finish_send(&self, st: &mut MacState, result: u8) {
        st.send_state = SendState::Idle;
        if let Some((index, key)) = st.send_key.take() {
            if let Some(op) = st.contexts[index]
                .sends
                .iter_mut()
                .find(|op| op.key == key)
            {
                ringbuf_entry!(Trace::Sent(result));
                op.state = OpState::Done(result);
                if let Some(waker) = op.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    fn drain_rx(&self, st: &mut MacState) {
        while let Some(received) = st.rx_queue.pop_front() {
            for i in 0..CONTEXT_COUNT {
                if received.pass_flags & (1 << i) != 0 {
                    self.rx_barriers[i].resume_first(received.packet);
                }
            }
        }
    }

    fn cancel_send(&self, index: usize, key: u32) {
        let mut st = self.st.borrow_mut();
        let Some(pos) = st.contexts[index]
            .sends
            .iter()
            .position(|op| op.key == key)
        else {
            return;
        };
        let active = st.send_key == Some((index, key));
        remove_send_op(&mut st.contexts[index].sends, pos);

        if active {
            // stop the in-flight attempt and detach the result
            self.phy.cancel_alarm(Alarm::Backoff);
            self.phy.cancel_alarm(Alarm::AckWait);
            if st.send_state == SendState::Cca {
                self.phy.stop_cca();
            }
            st.send_key = None;
            if st.tx_kind != Some(TxKind::Data) {
                st.send_state = SendState::Idle;
                self.select_for_send(&mut st);
            }
            // an in-flight transmission completes on its own; TxEnd sees
            // the detached result and returns the sender to idle
        }
    }
}

impl MacState {
    fn active_send_data(&self) -> &[u8] {
        match self.send_key {
            Some((index, key)) => {
                match self.contexts[index]
                    .sends
                    .iter()
                    .find(|op| op.key == key)
                {
                    Some(op) => &op.data,
                    None => &[0; 4],
                }
            }
            None => &[0; 4],
        }
    }

    fn send_packet_len(&self) -> usize {
        self.active_send_data()[0] as usize
    }
}

/// Future of a queued send. Dropping it cancels the operation.
pub struct Send<'a, P: Phy, R: RandomSource> {
    mac: &'a Mac<P, R>,
    index: usize,
    key: Option<u32>,
}

impl<P: Phy, R: RandomSource> Future for Send<'_, P, R> {
    type Output = u8;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u8> {
        let Some(key) = self.key else {
            // the send queue was full
            return Poll::Ready(0);
        };
        let mut st = self.mac.st.borrow_mut();
        let index = self.index;
        let Some(pos) = st.contexts[index]
            .sends
            .iter()
            .position(|op| op.key == key)
        else {
            return Poll::Ready(0);
        };
        match st.contexts[index].sends[pos].state {
            OpState::Done(result) => {
                remove_send_op(&mut st.contexts[index].sends, pos);
                drop(st);
                self.key = None;
                Poll::Ready(result)
            }
            _ => {
                st.contexts[index].sends[pos].waker =
                    Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<P: Phy, R: RandomSource> Drop for Send<'_, P, R> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.mac.cancel_send(self.index, key);
        }
    }
}

#[cfg(test)]
mod tests;
