// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IEEE 802.15.4 frame fields.
//!
//! A packet buffer starts with the PHY length byte (payload plus the two CRC
//! bytes), followed by the MAC payload: frame control, sequence number,
//! addressing fields. The CRC itself is appended and checked by the radio.

use bitflags::bitflags;

bitflags! {
    /// MAC frame control field.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FrameControl: u16 {
        const TYPE_BEACON = 0x0000;
        const TYPE_DATA = 0x0001;
        const TYPE_ACK = 0x0002;
        const TYPE_COMMAND = 0x0003;
        const TYPE_MASK = 0x0007;

        const SECURITY = 0x0008;
        const FRAME_PENDING = 0x0010;
        const ACKNOWLEDGE_REQUEST = 0x0020;
        const PAN_ID_COMPRESSION = 0x0040;
        const SEQUENCE_NUMBER_SUPPRESSION = 0x0100;

        // destination addressing mode, bits 10-11 (2: short, 3: long)
        const DESTINATION_ADDRESSING_LONG_FLAG = 0x0400;
        const DESTINATION_ADDRESSING_FLAG = 0x0800;
        const DESTINATION_ADDRESSING_SHORT = 0x0800;
        const DESTINATION_ADDRESSING_LONG = 0x0C00;
        const DESTINATION_ADDRESSING_MASK = 0x0C00;

        // source addressing mode, bits 14-15
        const SOURCE_ADDRESSING_LONG_FLAG = 0x4000;
        const SOURCE_ADDRESSING_FLAG = 0x8000;
        const SOURCE_ADDRESSING_MASK = 0xC000;
    }
}

/// MAC command identifiers we care about.
pub const COMMAND_DATA_REQUEST: u8 = 0x04;

/// Broadcast PAN id / short address.
pub const BROADCAST: u16 = 0xffff;

/// Frame control of a packet buffer (first byte is the PHY length).
pub fn frame_control(packet: &[u8]) -> FrameControl {
    FrameControl::from_bits_retain(
        packet[1] as u16 | (packet[2] as u16) << 8,
    )
}

pub fn frame_type(fc: FrameControl) -> FrameControl {
    fc & FrameControl::TYPE_MASK
}

/// Sequence number (only valid without sequence number suppression).
pub fn sequence_number(packet: &[u8]) -> u8 {
    packet[3]
}

/// Destination PAN id of a frame with destination addressing.
pub fn destination_pan(packet: &[u8]) -> u16 {
    packet[4] as u16 | (packet[5] as u16) << 8
}

/// Destination short address of a frame with short destination addressing.
pub fn destination_short(packet: &[u8]) -> u16 {
    packet[6] as u16 | (packet[7] as u16) << 8
}

/// Destination long address of a frame with long destination addressing.
pub fn destination_long(packet: &[u8]) -> u64 {
    u64::from_le_bytes(packet[6..14].try_into().unwrap())
}

/// The 5-byte acknowledge frame for `seq`, with the frame-pending bit when
/// requested.
pub fn ack_frame(seq: u8, frame_pending: bool) -> [u8; 4] {
    let mut fc = FrameControl::TYPE_ACK;
    if frame_pending {
        fc |= FrameControl::FRAME_PENDING;
    }
    [5, fc.bits() as u8, (fc.bits() >> 8) as u8, seq]
}

/// Source of a data-request command: PAN id and the 2- or 8-byte address.
pub struct DataRequestSource<'a> {
    pub pan: u16,
    pub address: &'a [u8],
}

/// Parses a frame as a MAC data-request command, returning its source
/// addressing when it is one.
pub fn parse_data_request(packet: &[u8]) -> Option<DataRequestSource<'_>> {
    let fc = frame_control(packet);
    let relevant = FrameControl::TYPE_MASK
        | FrameControl::SECURITY
        | FrameControl::PAN_ID_COMPRESSION
        | FrameControl::SEQUENCE_NUMBER_SUPPRESSION
        | FrameControl::DESTINATION_ADDRESSING_FLAG
        | FrameControl::SOURCE_ADDRESSING_FLAG;
    let expected = FrameControl::TYPE_COMMAND
        | FrameControl::PAN_ID_COMPRESSION
        | FrameControl::DESTINATION_ADDRESSING_FLAG
        | FrameControl::SOURCE_ADDRESSING_FLAG;
    if fc & relevant != expected {
        return None;
    }

    // length, frame control, sequence number
    let mut i = 1 + 2 + 1;
    let pan = u16::from_le_bytes(packet.get(i..i + 2)?.try_into().ok()?);
    i += 2;
    // destination address
    i += if fc.contains(FrameControl::DESTINATION_ADDRESSING_LONG_FLAG) {
        8
    } else {
        2
    };
    let src_len =
        if fc.contains(FrameControl::SOURCE_ADDRESSING_LONG_FLAG) {
            8
        } else {
            2
        };
    let address = packet.get(i..i + src_len)?;
    if *packet.get(i + src_len)? != COMMAND_DATA_REQUEST {
        return None;
    }
    Some(DataRequestSource { pan, address })
}
