// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT-SN v1.2 wire format.
//!
//! PDUs are length-prefixed: one byte when the total length fits in 255,
//! otherwise the three-byte form `0x01 hi lo`. All multi-byte integers are
//! big-endian. [`Writer`] builds a PDU into a caller-provided buffer and
//! fixes the length up in `finish`; [`Reader`] walks a received PDU with a
//! sticky validity flag, checked once after all fields are read, in the
//! style of the firmware's message readers.

#![cfg_attr(target_os = "none", no_std)]

/// Default UDP port of the gateway.
pub const GATEWAY_PORT: u16 = 47193;

/// Largest PDU we build or accept.
pub const MAX_MESSAGE_LENGTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    Connack = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0a,
    Regack = 0x0b,
    Publish = 0x0c,
    Puback = 0x0d,
    Subscribe = 0x12,
    Suback = 0x13,
    Unsubscribe = 0x14,
    Unsuback = 0x15,
    Pingreq = 0x16,
    Pingresp = 0x17,
    Disconnect = 0x18,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Advertise,
            0x01 => Self::SearchGw,
            0x02 => Self::GwInfo,
            0x04 => Self::Connect,
            0x05 => Self::Connack,
            0x06 => Self::WillTopicReq,
            0x07 => Self::WillTopic,
            0x08 => Self::WillMsgReq,
            0x09 => Self::WillMsg,
            0x0a => Self::Register,
            0x0b => Self::Regack,
            0x0c => Self::Publish,
            0x0d => Self::Puback,
            0x12 => Self::Subscribe,
            0x13 => Self::Suback,
            0x14 => Self::Unsubscribe,
            0x15 => Self::Unsuback,
            0x16 => Self::Pingreq,
            0x17 => Self::Pingresp,
            0x18 => Self::Disconnect,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0,
    RejectedCongested = 1,
    RejectedInvalidTopicId = 2,
    NotSupported = 3,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Accepted,
            1 => Self::RejectedCongested,
            2 => Self::RejectedInvalidTopicId,
            3 => Self::NotSupported,
            _ => return None,
        })
    }
}

/// Topic id type carried in the flags byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TopicType {
    Normal = 0,
    Predefined = 1,
    Short = 2,
}

/// The PDU flags byte: DUP (bit 7), QoS (bits 6-5), RETAIN (bit 4), WILL
/// (bit 3), CLEAN_SESSION (bit 2), topic type (bits 1-0).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u8);

impl Flags {
    pub const DUP: u8 = 0x80;
    pub const RETAIN: u8 = 0x10;
    pub const WILL: u8 = 0x08;
    pub const CLEAN_SESSION: u8 = 0x04;

    pub fn with_qos(self, qos: i8) -> Self {
        Self(self.0 & !0x60 | make_qos(qos))
    }

    pub fn qos(self) -> i8 {
        get_qos(self.0)
    }

    pub fn with_topic_type(self, t: TopicType) -> Self {
        Self(self.0 & !0x03 | t as u8)
    }

    pub fn topic_type(self) -> Option<TopicType> {
        match self.0 & 0x03 {
            0 => Some(TopicType::Normal),
            1 => Some(TopicType::Predefined),
            2 => Some(TopicType::Short),
            _ => None,
        }
    }

    pub fn dup(self) -> bool {
        self.0 & Self::DUP != 0
    }

    pub fn set(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// QoS -1..=2 to its two-bit encoding.
pub fn make_qos(qos: i8) -> u8 {
    ((qos as u8) & 3) << 5
}

/// Two-bit QoS field back to -1..=2.
pub fn get_qos(flags: u8) -> i8 {
    (((flags >> 5 & 3) + 1) & 3) as i8 - 1
}

/// Serializer for one PDU.
pub struct Writer<'a> {
    buffer: &'a mut [u8],
    /// write position, leaving room for the worst-case length prefix
    pos: usize,
    overflow: bool,
}

const LENGTH_RESERVE: usize = 3;

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            pos: LENGTH_RESERVE,
            overflow: false,
        }
    }

    pub fn msg_type(&mut self, t: MsgType) -> &mut Self {
        self.u8(t as u8)
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = value;
            self.pos += 1;
        } else {
            self.overflow = true;
        }
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.u8((value >> 8) as u8);
        self.u8(value as u8)
    }

    pub fn flags(&mut self, flags: Flags) -> &mut Self {
        self.u8(flags.0)
    }

    pub fn return_code(&mut self, code: ReturnCode) -> &mut Self {
        self.u8(code as u8)
    }

    pub fn data(&mut self, data: &[u8]) -> &mut Self {
        for &b in data {
            self.u8(b);
        }
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.data(s.as_bytes())
    }

    /// Fixes up the length prefix and returns the finished PDU. `None` when
    /// the buffer was too small.
    pub fn finish(&mut self) -> Option<&[u8]> {
        if self.overflow {
            return None;
        }
        let body = self.pos - LENGTH_RESERVE;
        if body + 1 <= 255 {
            self.buffer[LENGTH_RESERVE - 1] = (body + 1) as u8;
            Some(&self.buffer[LENGTH_RESERVE - 1..self.pos])
        } else {
            let total = (body + 3) as u16;
            self.buffer[0] = 0x01;
            self.buffer[1] = (total >> 8) as u8;
            self.buffer[2] = total as u8;
            Some(&self.buffer[..self.pos])
        }
    }
}

/// Bounds-checked PDU reader. Reads past the end poison the reader; check
/// [`Reader::is_valid`] when done.
#[derive(Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    valid: bool,
}

impl<'a> Reader<'a> {
    /// Starts reading a datagram; decodes the length prefix and limits the
    /// reader to it. `None` when the datagram is shorter than its length
    /// field claims.
    pub fn new(datagram: &'a [u8]) -> Option<Self> {
        if datagram.is_empty() {
            return None;
        }
        let (length, skip) = if datagram[0] == 0x01 {
            if datagram.len() < 3 {
                return None;
            }
            ((datagram[1] as usize) << 8 | datagram[2] as usize, 3)
        } else {
            (datagram[0] as usize, 1)
        };
        if length < skip || length > datagram.len() {
            return None;
        }
        Some(Self {
            data: &datagram[skip..length],
            pos: 0,
            valid: true,
        })
    }

    pub fn msg_type(&mut self) -> Option<MsgType> {
        MsgType::from_u8(self.u8())
    }

    pub fn u8(&mut self) -> u8 {
        if self.pos < self.data.len() {
            let v = self.data[self.pos];
            self.pos += 1;
            v
        } else {
            self.valid = false;
            0
        }
    }

    pub fn u16(&mut self) -> u16 {
        let hi = self.u8();
        (hi as u16) << 8 | self.u8() as u16
    }

    pub fn flags(&mut self) -> Flags {
        Flags(self.u8())
    }

    pub fn return_code(&mut self) -> Option<ReturnCode> {
        ReturnCode::from_u8(self.u8())
    }

    pub fn skip(&mut self, n: usize) {
        if self.pos + n <= self.data.len() {
            self.pos += n;
        } else {
            self.pos = self.data.len();
            self.valid = false;
        }
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let r = &self.data[self.pos..];
        self.pos = self.data.len();
        r
    }

    /// The rest as UTF-8 text (topic names, client ids).
    pub fn string(&mut self) -> &'a str {
        match core::str::from_utf8(self.rest()) {
            Ok(s) => s,
            Err(_) => {
                self.valid = false;
                ""
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_encoding() {
        assert_eq!(make_qos(0), 0x00);
        assert_eq!(make_qos(1), 0x20);
        assert_eq!(make_qos(2), 0x40);
        assert_eq!(make_qos(-1), 0x60);
        for qos in [-1i8, 0, 1, 2] {
            assert_eq!(get_qos(make_qos(qos)), qos);
        }
    }

    #[test]
    fn writer_produces_short_length() {
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let mut w = Writer::new(&mut buf);
        w.msg_type(MsgType::Pingreq);
        let pdu = w.finish().unwrap();
        assert_eq!(pdu, &[2, 0x16]);
    }

    #[test]
    fn publish_round_trip() {
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let mut w = Writer::new(&mut buf);
        w.msg_type(MsgType::Publish)
            .flags(Flags::default().with_qos(1).set(Flags::RETAIN))
            .u16(0x0007) // topic id
            .u16(0x1234) // msg id
            .string("on");
        let pdu = w.finish().unwrap().to_vec();

        let mut r = Reader::new(&pdu).unwrap();
        assert_eq!(r.msg_type(), Some(MsgType::Publish));
        let flags = r.flags();
        assert_eq!(flags.qos(), 1);
        assert!(flags.contains(Flags::RETAIN));
        assert!(!flags.dup());
        assert_eq!(r.u16(), 0x0007);
        assert_eq!(r.u16(), 0x1234);
        assert_eq!(r.string(), "on");
        assert!(r.is_valid());
    }

    #[test]
    fn long_length_form() {
        let payload = [0x55u8; 300];
        let mut buf = [0u8; 310];
        let mut w = Writer::new(&mut buf);
        w.msg_type(MsgType::Publish).data(&payload);
        let pdu = w.finish().unwrap().to_vec();
        assert_eq!(pdu[0], 0x01);
        assert_eq!(
            (pdu[1] as usize) << 8 | pdu[2] as usize,
            pdu.len()
        );

        let mut r = Reader::new(&pdu).unwrap();
        assert_eq!(r.msg_type(), Some(MsgType::Publish));
        assert_eq!(r.rest().len(), 300);
        assert!(r.is_valid());
    }

    #[test]
    fn truncated_datagram_rejected() {
        // claims 10 bytes, delivers 4
        let datagram = [10u8, 0x0c, 0x00, 0x00];
        assert!(Reader::new(&datagram).is_none());
    }

    #[test]
    fn reading_past_end_invalidates() {
        let datagram = [3u8, 0x0d, 0x01];
        let mut r = Reader::new(&datagram).unwrap();
        assert_eq!(r.msg_type(), Some(MsgType::Puback));
        let _ = r.u16(); // only one byte left
        assert!(!r.is_valid());
    }

    #[test]
    fn datagram_longer_than_pdu_is_bounded() {
        // trailing junk after the PDU must not be exposed
        let datagram = [3u8, 0x16, 0x55, 0xaa, 0xbb];
        let mut r = Reader::new(&datagram).unwrap();
        assert_eq!(r.msg_type(), Some(MsgType::Pingreq));
        assert_eq!(r.rest(), &[0x55]);
    }

    #[test]
    fn writer_overflow_reported() {
        let mut buf = [0u8; 6];
        let mut w = Writer::new(&mut buf);
        w.msg_type(MsgType::Publish).data(&[1, 2, 3, 4, 5, 6]);
        assert!(w.finish().is_none());
    }
}
