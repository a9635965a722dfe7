// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal USB device: control-endpoint dispatch plus one bulk pair.
//!
//! This is the transport the host-side radio dongle uses: vendor requests
//! on the control endpoint configure the radio (reset, start, stop, set
//! PAN/short address/filter flags/long address, enable receiver), and the
//! bulk endpoints carry radio packets. Each endpoint runs a small state
//! machine; the hardware glue feeds [`UsbEvent`]s from event-loop context.
//!
//! Decoded vendor requests queue up for the control task; received bulk
//! packets go to the oldest waiting read.

#![cfg_attr(target_os = "none", no_std)]

use core::cell::RefCell;
use core::task::Waker;
use exec::{Barrier, BarrierWait};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::FromBytes;
use zerocopy_derive::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

pub const MAX_PACKET: usize = 64;

pub type Packet = heapless::Vec<u8, MAX_PACKET>;

/// The standard 8-byte setup packet.
#[derive(Copy, Clone, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: U16,
    pub index: U16,
    pub length: U16,
}

/// Vendor requests understood by the dongle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VendorRequest {
    Reset,
    /// Channel 10..=26 in the value word.
    Start { channel: u8 },
    Stop,
    EnableReceiver { enable: bool },
    SetPan { index: u8, pan: u16 },
    SetShortAddress { index: u8, address: u16 },
    SetFlags { index: u8, flags: u8 },
    /// The address arrives in the data stage.
    SetLongAddress { address: u64 },
}

const REQUEST_RESET: u8 = 0;
const REQUEST_START: u8 = 1;
const REQUEST_STOP: u8 = 2;
const REQUEST_ENABLE_RECEIVER: u8 = 3;
const REQUEST_SET_PAN: u8 = 4;
const REQUEST_SET_SHORT_ADDRESS: u8 = 5;
const REQUEST_SET_FLAGS: u8 = 6;
const REQUEST_SET_LONG_ADDRESS: u8 = 7;

/// Vendor, device-directed, host-to-device.
const VENDOR_OUT: u8 = 0x40;

/// What the device needs from the hardware.
pub trait UsbHw {
    /// Acknowledges the status stage of a control transfer.
    fn ep0_ack(&self);
    fn ep0_stall(&self);
    /// Transmits one bulk IN packet.
    fn ep_write(&self, endpoint: u8, data: &[u8]);
}

/// Events from the hardware glue.
#[derive(Debug)]
pub enum UsbEvent<'a> {
    Reset,
    Setup([u8; 8]),
    /// Data stage of the current control transfer.
    Ep0Out(&'a [u8]),
    /// A bulk IN transmission finished.
    InComplete(u8),
    /// A bulk OUT packet arrived.
    Out(u8, &'a [u8]),
}

#[derive(Copy, Clone, PartialEq)]
enum ControlState {
    Idle,
    /// Awaiting the data stage for this setup packet.
    AwaitData(SetupPacket),
}

struct DeviceState {
    control: ControlState,
    in_busy: bool,
    in_waker: Option<Waker>,
}

pub struct UsbDevice<H: UsbHw> {
    hw: H,
    st: RefCell<DeviceState>,
    requests: Barrier<VendorRequest>,
    received: Barrier<Packet>,
}

impl<H: UsbHw> UsbDevice<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            st: RefCell::new(DeviceState {
                control: ControlState::Idle,
                in_busy: false,
                in_waker: None,
            }),
            requests: Barrier::new(),
            received: Barrier::new(),
        }
    }

    /// Waits for the next decoded vendor request.
    pub fn control_request(&self) -> BarrierWait<'_, VendorRequest> {
        self.requests.wait()
    }

    /// Waits for the next bulk OUT packet.
    pub fn receive(&self) -> BarrierWait<'_, Packet> {
        self.received.wait()
    }

    /// Queues a bulk IN packet; false while a transmission is in flight.
    pub fn send(&self, endpoint: u8, data: &[u8]) -> bool {
        let mut st = self.st.borrow_mut();
        if st.in_busy {
            return false;
        }
        st.in_busy = true;
        drop(st);
        self.hw.ep_write(endpoint, data);
        true
    }

    pub fn on_event(&self, event: UsbEvent<'_>) {
        match event {
            UsbEvent::Reset => {
                let mut st = self.st.borrow_mut();
                st.control = ControlState::Idle;
                st.in_busy = false;
            }
            UsbEvent::Setup(raw) => self.on_setup(&raw),
            UsbEvent::Ep0Out(data) => {
                let setup = {
                    let mut st = self.st.borrow_mut();
                    match st.control {
                        ControlState::AwaitData(setup) => {
                            st.control = ControlState::Idle;
                            Some(setup)
                        }
                        ControlState::Idle => None,
                    }
                };
                let Some(setup) = setup else { return };
                match decode_with_data(&setup, data) {
                    Some(request) => {
                        self.requests.resume_first(request);
                        self.hw.ep0_ack();
                    }
                    None => self.hw.ep0_stall(),
                }
            }
            UsbEvent::InComplete(_endpoint) => {
                let mut st = self.st.borrow_mut();
                st.in_busy = false;
                if let Some(waker) = st.in_waker.take() {
                    waker.wake();
                }
            }
            UsbEvent::Out(_endpoint, data) => {
                let packet = Packet::from_slice(
                    &data[..data.len().min(MAX_PACKET)],
                )
                .unwrap_or_default();
                self.received.resume_first(packet);
            }
        }
    }

    fn on_setup(&self, raw: &[u8; 8]) {
        let Ok(setup) = SetupPacket::read_from_bytes(&raw[..]) else {
            self.hw.ep0_stall();
            return;
        };
        if setup.request_type != VENDOR_OUT {
            self.hw.ep0_stall();
            return;
        }
        if setup.length.get() != 0 {
            // data stage follows
            self.st.borrow_mut().control =
                ControlState::AwaitData(setup);
            return;
        }
        match decode(&setup) {
            Some(request) => {
                self.requests.resume_first(request);
                self.hw.ep0_ack();
            }
            None => self.hw.ep0_stall(),
        }
    }
}

fn decode(setup: &SetupPacket) -> Option<VendorRequest> {
    let value = setup.value.get();
    let index = setup.index.get();
    Some(match setup.request {
        REQUEST_RESET => VendorRequest::Reset,
        REQUEST_START => VendorRequest::Start {
            channel: value as u8,
        },
        REQUEST_STOP => VendorRequest::Stop,
        REQUEST_ENABLE_RECEIVER => VendorRequest::EnableReceiver {
            enable: value != 0,
        },
        REQUEST_SET_PAN => VendorRequest::SetPan {
            index: index as u8,
            pan: value,
        },
        REQUEST_SET_SHORT_ADDRESS => VendorRequest::SetShortAddress {
            index: index as u8,
            address: value,
        },
        REQUEST_SET_FLAGS => VendorRequest::SetFlags {
            index: index as u8,
            flags: value as u8,
        },
        _ => return None,
    })
}

fn decode_with_data(
    setup: &SetupPacket,
    data: &[u8],
) -> Option<VendorRequest> {
    match setup.request {
        REQUEST_SET_LONG_ADDRESS => {
            let address =
                u64::from_le_bytes(data.get(..8)?.try_into().ok()?);
            Some(VendorRequest::SetLongAddress { address })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::future::Future;
    use core::pin::Pin;
    use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
    use std::cell::RefCell as StdRefCell;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct FakeHw {
        acks: core::cell::Cell<u32>,
        stalls: core::cell::Cell<u32>,
        written: StdRefCell<StdVec<(u8, StdVec<u8>)>>,
    }

    impl UsbHw for &FakeHw {
        fn ep0_ack(&self) {
            self.acks.set(self.acks.get() + 1);
        }

        fn ep0_stall(&self) {
            self.stalls.set(self.stalls.get() + 1);
        }

        fn ep_write(&self, endpoint: u8, data: &[u8]) {
            self.written.borrow_mut().push((endpoint, data.to_vec()));
        }
    }

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

    fn setup(request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0] = VENDOR_OUT;
        raw[1] = request;
        raw[2..4].copy_from_slice(&value.to_le_bytes());
        raw[4..6].copy_from_slice(&index.to_le_bytes());
        raw[6..8].copy_from_slice(&length.to_le_bytes());
        raw
    }

    #[test]
    fn vendor_request_decoded_and_acked() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);
        let mut cx = noop_context();

        let mut req = dev.control_request();
        assert!(Pin::new(&mut req).poll(&mut cx).is_pending());

        dev.on_event(UsbEvent::Setup(setup(REQUEST_START, 15, 0, 0)));
        assert_eq!(
            Pin::new(&mut req).poll(&mut cx),
            Poll::Ready(VendorRequest::Start { channel: 15 })
        );
        assert_eq!(hw.acks.get(), 1);
    }

    #[test]
    fn set_pan_carries_value_and_index() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);
        let mut cx = noop_context();

        let mut req = dev.control_request();
        let _ = Pin::new(&mut req).poll(&mut cx);
        dev.on_event(UsbEvent::Setup(setup(
            REQUEST_SET_PAN,
            0x1234,
            1,
            0,
        )));
        assert_eq!(
            Pin::new(&mut req).poll(&mut cx),
            Poll::Ready(VendorRequest::SetPan {
                index: 1,
                pan: 0x1234
            })
        );
    }

    #[test]
    fn long_address_uses_the_data_stage() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);
        let mut cx = noop_context();

        let mut req = dev.control_request();
        let _ = Pin::new(&mut req).poll(&mut cx);

        dev.on_event(UsbEvent::Setup(setup(
            REQUEST_SET_LONG_ADDRESS,
            0,
            0,
            8,
        )));
        // nothing decoded until the data stage arrives
        assert!(Pin::new(&mut req).poll(&mut cx).is_pending());
        assert_eq!(hw.acks.get(), 0);

        dev.on_event(UsbEvent::Ep0Out(
            &0x1122_3344_5566_7788u64.to_le_bytes(),
        ));
        assert_eq!(
            Pin::new(&mut req).poll(&mut cx),
            Poll::Ready(VendorRequest::SetLongAddress {
                address: 0x1122_3344_5566_7788
            })
        );
        assert_eq!(hw.acks.get(), 1);
    }

    #[test]
    fn unknown_request_stalls() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);
        dev.on_event(UsbEvent::Setup(setup(0x7f, 0, 0, 0)));
        assert_eq!(hw.stalls.get(), 1);
        // non-vendor requests stall as well
        let mut raw = setup(REQUEST_RESET, 0, 0, 0);
        raw[0] = 0x80;
        dev.on_event(UsbEvent::Setup(raw));
        assert_eq!(hw.stalls.get(), 2);
    }

    #[test]
    fn bulk_out_reaches_waiting_read() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);
        let mut cx = noop_context();

        let mut read = dev.receive();
        assert!(Pin::new(&mut read).poll(&mut cx).is_pending());
        dev.on_event(UsbEvent::Out(1, &[1, 2, 3]));
        match Pin::new(&mut read).poll(&mut cx) {
            Poll::Ready(packet) => assert_eq!(&packet[..], &[1, 2, 3]),
            Poll::Pending => panic!("no packet"),
        }
    }

    #[test]
    fn bulk_in_serializes_transmissions() {
        let hw = FakeHw::default();
        let dev = UsbDevice::new(&hw);

        assert!(dev.send(1, &[1]));
        // busy until the completion event
        assert!(!dev.send(1, &[2]));
        dev.on_event(UsbEvent::InComplete(1));
        assert!(dev.send(1, &[2]));
        assert_eq!(hw.written.borrow().len(), 2);
    }
}
