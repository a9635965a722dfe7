// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame formats on the field bus.
//!
//! Bytes taking part in arbitration are encoded so that simultaneous
//! senders corrupt nothing: a value n in 0..=8 becomes a byte with n one
//! bits from the LSB, so the wire AND of two encodings is again a valid
//! encoding and the sender with more dominant bits survives.
//!
//! - Encoded device id: 11 bytes, each carrying 3 id bits as bit count 1..8.
//! - Encoded address: two bytes, `(addr & 7) + 1` (never zero, so messages
//!   always lose against commands) and `addr / 8` as bit count 0..8.
//!
//! Frames:
//!
//! - Enumerate (node, contending): `0 <encoded id> <version> <endpoints>
//!   <MIC(default key)>`
//! - Commission (master): `0 0 <device id> <address> <key> <MIC(default
//!   key)>`; the second zero outbids every enumerate frame.
//! - Message (node or master): `<encoded address> <security counter>
//!   <payload> <MIC(key)>`
//! - Acknowledge: CRC-8 of the message bytes.
//!
//! The MIC is AES-128-CCM with a 4-byte tag over the frame as associated
//! data; the nonce packs the address byte and the 32-bit security counter.

use crate::{Frame, MAX_MESSAGE_LENGTH};
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use crc::{Crc, CRC_8_SMBUS};

/// Key used before commissioning assigns a network key.
pub const DEFAULT_KEY: [u8; 16] = [
    0x77, 0x53, 0x54, 0x2b, 0x62, 0x0e, 0xc1, 0x9e, 0x83, 0x9f, 0xa1,
    0x21, 0x74, 0x0c, 0x8b, 0x90,
];

pub const MIC_LENGTH: usize = 4;
pub const ENCODED_ID_LENGTH: usize = 11;

type BusCcm = Ccm<Aes128, U4, U13>;

const ACK_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// A value 0..=8 as a byte with that many one bits from the LSB.
fn bit_count_byte(n: u32) -> u8 {
    ((1u16 << n) - 1) as u8
}

/// Inverse of [`bit_count_byte`]; `None` if the byte is not of that form.
fn decode_bit_count(byte: u8) -> Option<u32> {
    if (byte as u16 + 1).is_power_of_two() {
        Some(byte.count_ones())
    } else {
        None
    }
}

/// Encodes a device id for arbitration, 3 bits per byte, low bits first,
/// each as bit count 1..8.
pub fn encode_device_id(id: u32) -> [u8; ENCODED_ID_LENGTH] {
    core::array::from_fn(|i| {
        bit_count_byte(((id >> (i * 3)) & 7) + 1)
    })
}

pub fn decode_device_id(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < ENCODED_ID_LENGTH {
        return None;
    }
    let mut id: u64 = 0;
    for i in 0..ENCODED_ID_LENGTH {
        let n = decode_bit_count(bytes[i])?;
        if n == 0 {
            return None;
        }
        id |= ((n - 1) as u64) << (i * 3);
    }
    Some(id as u32)
}

/// Encodes a node address; the first byte is never zero, so message frames
/// always lose arbitration against command frames.
pub fn encode_address(address: u8) -> [u8; 2] {
    [
        bit_count_byte((address as u32 & 7) + 1),
        bit_count_byte(address as u32 >> 3),
    ]
}

pub fn decode_address(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 2 {
        return None;
    }
    let low = decode_bit_count(bytes[0])?;
    if low == 0 {
        return None;
    }
    let high = decode_bit_count(bytes[1])?;
    if high > 7 {
        return None;
    }
    Some((low as u8 - 1) | (high as u8) << 3)
}

/// The acknowledge a receiver returns for a message.
pub fn ack_crc(message: &[u8]) -> u8 {
    ACK_CRC.checksum(message)
}

fn compute_mic(
    key: &[u8; 16],
    address: u8,
    counter: u32,
    data: &[u8],
) -> [u8; MIC_LENGTH] {
    let mut nonce = [0u8; 13];
    nonce[0] = address;
    nonce[1..5].copy_from_slice(&counter.to_le_bytes());
    let cipher = BusCcm::new(GenericArray::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            data,
            &mut [],
        )
        .unwrap_or_default();
    tag.into()
}

fn push_mic(frame: &mut Frame, key: &[u8; 16], address: u8, counter: u32) {
    let mic = compute_mic(key, address, counter, frame);
    frame.extend_from_slice(&mic).ok();
}

fn split_mic(frame: &[u8]) -> Option<(&[u8], &[u8])> {
    if frame.len() < MIC_LENGTH {
        return None;
    }
    Some(frame.split_at(frame.len() - MIC_LENGTH))
}

fn check_mic<'a>(
    frame: &'a [u8],
    key: &[u8; 16],
    address: u8,
    counter: u32,
) -> Option<&'a [u8]> {
    let (body, mic) = split_mic(frame)?;
    if compute_mic(key, address, counter, body) == mic {
        Some(body)
    } else {
        None
    }
}

/// A node's contention frame during enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Enumerate {
    pub device_id: u32,
    pub protocol_version: u8,
    pub endpoint_count: u8,
}

pub fn build_enumerate(e: &Enumerate) -> Frame {
    let mut frame = Frame::new();
    frame.push(0).ok();
    frame.extend_from_slice(&encode_device_id(e.device_id)).ok();
    frame.push(e.protocol_version).ok();
    frame.push(e.endpoint_count).ok();
    push_mic(&mut frame, &DEFAULT_KEY, 0, e.device_id);
    frame
}

pub fn parse_enumerate(frame: &[u8]) -> Option<Enumerate> {
    let (body, _) = split_mic(frame)?;
    if body.len() != 1 + ENCODED_ID_LENGTH + 2 || body[0] != 0 {
        return None;
    }
    if body[1] == 0 {
        // second zero: this is a commission frame
        return None;
    }
    let device_id = decode_device_id(&body[1..])?;
    check_mic(frame, &DEFAULT_KEY, 0, device_id)?;
    Some(Enumerate {
        device_id,
        protocol_version: body[1 + ENCODED_ID_LENGTH],
        endpoint_count: body[1 + ENCODED_ID_LENGTH + 1],
    })
}

/// The master's commissioning assignment to one enumerated node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Commission {
    pub device_id: u32,
    pub address: u8,
    pub key: [u8; 16],
}

pub fn build_commission(c: &Commission) -> Frame {
    let mut frame = Frame::new();
    frame.push(0).ok();
    frame.push(0).ok();
    frame.extend_from_slice(&c.device_id.to_le_bytes()).ok();
    frame.push(c.address).ok();
    frame.extend_from_slice(&c.key).ok();
    push_mic(&mut frame, &DEFAULT_KEY, c.address, c.device_id);
    frame
}

pub fn parse_commission(frame: &[u8]) -> Option<Commission> {
    let (body, _) = split_mic(frame)?;
    if body.len() != 2 + 4 + 1 + 16 || body[0] != 0 || body[1] != 0 {
        return None;
    }
    let device_id = u32::from_le_bytes(body[2..6].try_into().ok()?);
    let address = body[6];
    check_mic(frame, &DEFAULT_KEY, address, device_id)?;
    let mut key = [0u8; 16];
    key.copy_from_slice(&body[7..23]);
    Some(Commission {
        device_id,
        address,
        key,
    })
}

/// Payload of an authenticated message frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Attribute read request or attribute data (marker byte 255).
    Attribute {
        endpoint: u8,
        attribute: u8,
        data: &'a [u8],
    },
    /// A plug message for an endpoint.
    Plug {
        endpoint: u8,
        plug: u8,
        message: &'a [u8],
    },
}

pub fn build_message(
    address: u8,
    counter: u32,
    payload: &Payload<'_>,
    key: &[u8; 16],
) -> Frame {
    let mut frame = Frame::new();
    frame.extend_from_slice(&encode_address(address)).ok();
    frame.extend_from_slice(&counter.to_le_bytes()).ok();
    match payload {
        Payload::Attribute {
            endpoint,
            attribute,
            data,
        } => {
            frame.push(255).ok();
            frame.push(*endpoint).ok();
            frame.push(*attribute).ok();
            frame.extend_from_slice(data).ok();
        }
        Payload::Plug {
            endpoint,
            plug,
            message,
        } => {
            frame.push(*endpoint).ok();
            frame.push(*plug).ok();
            frame.extend_from_slice(message).ok();
        }
    }
    push_mic(&mut frame, key, address, counter);
    frame
}

/// A parsed message frame: source address, security counter and payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeMessage<'a> {
    pub address: u8,
    pub counter: u32,
    pub payload: Payload<'a>,
}

/// Parses and authenticates a message frame. `key_for` maps a source
/// address to the provisioned key for that node.
pub fn parse_message<'a>(
    frame: &'a [u8],
    key_for: impl Fn(u8) -> Option<[u8; 16]>,
) -> Option<NodeMessage<'a>> {
    if frame.len() < 2 + 4 + 2 + MIC_LENGTH
        || frame.len() > MAX_MESSAGE_LENGTH
    {
        return None;
    }
    let address = decode_address(&frame[0..2])?;
    let counter = u32::from_le_bytes(frame[2..6].try_into().ok()?);
    let key = key_for(address)?;
    let body = check_mic(frame, &key, address, counter)?;
    let p = &body[6..];
    let payload = if p[0] == 255 {
        if p.len() < 3 {
            return None;
        }
        Payload::Attribute {
            endpoint: p[1],
            attribute: p[2],
            data: &p[3..],
        }
    } else {
        if p.len() < 2 {
            return None;
        }
        Payload::Plug {
            endpoint: p[0],
            plug: p[1],
            message: &p[2..],
        }
    };
    Some(NodeMessage {
        address,
        counter,
        payload,
    })
}
