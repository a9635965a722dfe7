// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Downlink send queue.
//!
//! Messages bound for clients are buffered here before the pump pushes them
//! out through the transport. A record addresses one client or a set of
//! clients, references its bytes in a shared arena, and carries its message
//! id; fire-and-forget records (message id zero) become garbage right after
//! transmission, acknowledged ones stay until the PUBACK arrives or the
//! sender gives up. Garbage collection compacts the arena when an enqueue
//! would not fit, and never runs while a transmission borrows the arena:
//! the pump copies a record out before awaiting the transport.

use systime::{SystemDuration, SystemTime};

pub const MAX_SEND_COUNT: usize = 16;
pub const SEND_BUFFER_SIZE: usize = 1024;
const MAX_RECORD_LENGTH: usize = 64;

/// One client index or a bitmask of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientSet(pub u64);

impl ClientSet {
    pub fn single(connection: usize) -> Self {
        Self(1 << connection)
    }

    pub fn contains(self, connection: usize) -> bool {
        self.0 & 1 << connection != 0
    }

    pub fn remove(&mut self, connection: usize) {
        self.0 &= !(1 << connection);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |&i| self.contains(i))
    }
}

/// Ordered removal; `swap_remove` would break the queue's FIFO order.
fn remove_record(
    records: &mut heapless::Vec<Record, MAX_SEND_COUNT>,
    pos: usize,
) {
    for i in pos..records.len() - 1 {
        records[i] = records[i + 1];
    }
    records.truncate(records.len() - 1);
}

#[derive(Copy, Clone, Debug)]
struct Record {
    clients: ClientSet,
    offset: u16,
    length: u16,
    msg_id: u16,
    sent: bool,
    first_sent: SystemTime,
}

pub struct SendQueue {
    records: heapless::Vec<Record, MAX_SEND_COUNT>,
    buffer: [u8; SEND_BUFFER_SIZE],
    buffer_head: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            records: heapless::Vec::new(),
            buffer: [0; SEND_BUFFER_SIZE],
            buffer_head: 0,
        }
    }

    /// Buffers a message for `clients`. False when the queue stays full
    /// even after garbage collection.
    pub fn enqueue(
        &mut self,
        clients: ClientSet,
        data: &[u8],
        msg_id: u16,
        now: SystemTime,
    ) -> bool {
        if data.is_empty() || data.len() > MAX_RECORD_LENGTH {
            return false;
        }
        if self.records.is_full()
            || self.buffer_head + data.len() > SEND_BUFFER_SIZE
        {
            self.collect_garbage();
        }
        if self.records.is_full()
            || self.buffer_head + data.len() > SEND_BUFFER_SIZE
        {
            return false;
        }
        let offset = self.buffer_head;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.buffer_head += data.len();
        self.records
            .push(Record {
                clients,
                offset: offset as u16,
                length: data.len() as u16,
                msg_id,
                sent: false,
                first_sent: now,
            })
            .ok();
        true
    }

    /// Hands the oldest untransmitted record to the pump, copied out so the
    /// arena stays collectable during the transmission. Fire-and-forget
    /// records are consumed by this.
    pub fn take_next(
        &mut self,
    ) -> Option<(ClientSet, u16, heapless::Vec<u8, MAX_RECORD_LENGTH>)>
    {
        let pos = self.records.iter().position(|r| !r.sent)?;
        let record = &mut self.records[pos];
        record.sent = true;
        let clients = record.clients;
        let msg_id = record.msg_id;
        let start = record.offset as usize;
        let end = start + record.length as usize;
        let data =
            heapless::Vec::from_slice(&self.buffer[start..end]).ok()?;
        if msg_id == 0 {
            remove_record(&mut self.records, pos);
        }
        Some((clients, msg_id, data))
    }

    /// Retrieves a sent record's bytes for a DUP retransmission.
    pub fn peek_sent(
        &self,
        msg_id: u16,
    ) -> Option<heapless::Vec<u8, MAX_RECORD_LENGTH>> {
        let record = self
            .records
            .iter()
            .find(|r| r.sent && r.msg_id == msg_id)?;
        let start = record.offset as usize;
        let end = start + record.length as usize;
        heapless::Vec::from_slice(&self.buffer[start..end]).ok()
    }

    /// Drops `connection` from a sent record's destination set, removing
    /// the record once every destination acknowledged (or was given up on).
    pub fn remove_sent(&mut self, msg_id: u16, connection: usize) {
        if let Some(pos) = self
            .records
            .iter()
            .position(|r| r.sent && r.msg_id == msg_id)
        {
            self.records[pos].clients.remove(connection);
            if self.records[pos].clients.is_empty() {
                remove_record(&mut self.records, pos);
            }
        }
    }

    pub fn first_sent_time(&self, msg_id: u16) -> Option<SystemTime> {
        self.records
            .iter()
            .find(|r| r.sent && r.msg_id == msg_id)
            .map(|r| r.first_sent)
    }

    /// Re-arms overdue unacknowledged records for retransmission with the
    /// DUP flag set, and drops records whose retry budget is spent. True
    /// when something was re-armed.
    pub fn resend_overdue(
        &mut self,
        now: SystemTime,
        timeout: SystemDuration,
        give_up: SystemDuration,
    ) -> bool {
        let mut again = false;
        let mut i = 0;
        while i < self.records.len() {
            let r = self.records[i];
            if r.sent && r.msg_id != 0 {
                let age = now - r.first_sent;
                if age >= give_up {
                    remove_record(&mut self.records, i);
                    continue;
                }
                if age >= timeout {
                    let offset = r.offset as usize;
                    // PUBLISH layout: length, type, flags
                    if self.buffer[offset + 1] == 0x0c {
                        self.buffer[offset + 2] |= 0x80;
                    }
                    self.records[i].sent = false;
                    again = true;
                }
            }
            i += 1;
        }
        again
    }

    /// Compacts the arena, keeping only records that still matter: unsent
    /// ones and sent ones still waiting for acknowledgement.
    fn collect_garbage(&mut self) {
        let mut kept = heapless::Vec::new();
        for r in self.records.iter() {
            if !(r.sent && r.msg_id == 0) {
                kept.push(*r).ok();
            }
        }
        self.records = kept;
        let mut head = 0usize;
        for i in 0..self.records.len() {
            let start = self.records[i].offset as usize;
            let length = self.records[i].length as usize;
            self.buffer.copy_within(start..start + length, head);
            self.records[i].offset = head as u16;
            head += length;
        }
        self.buffer_head = head;
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_unsent(&self) -> bool {
        self.records.iter().any(|r| !r.sent)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // live records stay inside the used prefix of the arena
        for r in &self.records {
            assert!(
                r.offset as usize + r.length as usize <= self.buffer_head
            );
        }
        // garbage collection leaves no consumed fire-and-forget records
        assert!(!self.records.iter().any(|r| r.sent && r.msg_id == 0));
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}
