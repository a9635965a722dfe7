// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The topic table and the retained-message arena.
//!
//! Topics are identified by their index; the wire-visible topic id for
//! clients is index + 1. A slot is free while its name hash is zero. Each
//! topic tracks a two-bit QoS entry per connection (0..2 subscribed at that
//! QoS, 3 not subscribed), the topic id the upstream gateway assigned, and a
//! local subscription reference count.
//!
//! Retained payloads share one byte arena. Each topic references its slice
//! by offset/length/capacity; inserting or erasing shifts the arena and
//! fixes up every topic at or behind the mutation point.

use crate::MAX_CONNECTION_COUNT;

pub const MAX_TOPIC_COUNT: usize = 64;
pub const RETAINED_BUFFER_SIZE: usize = 2048;

const QOS_WORDS: usize = (MAX_CONNECTION_COUNT + 15) / 16;

/// Not-subscribed marker in a [`QosArray`] entry.
pub const NOT_SUBSCRIBED: u8 = 3;

/// Two bits of subscription QoS per connection; 0..2 is the subscription
/// QoS, 3 means not subscribed.
#[derive(Copy, Clone, Debug)]
pub struct QosArray {
    words: [u32; QOS_WORDS],
}

impl QosArray {
    pub const fn all_unsubscribed() -> Self {
        Self {
            words: [!0; QOS_WORDS],
        }
    }

    pub fn get(&self, connection: usize) -> u8 {
        let shift = (connection << 1) & 31;
        (self.words[connection >> 4] >> shift & 3) as u8
    }

    pub fn set(&mut self, connection: usize, qos: u8) {
        let shift = (connection << 1) & 31;
        let word = &mut self.words[connection >> 4];
        *word = *word & !(3 << shift) | (qos as u32 & 3) << shift;
    }

    /// Clears a connection's entry back to "not subscribed", returning the
    /// previous value.
    pub fn clear(&mut self, connection: usize) -> u8 {
        let qos = self.get(connection);
        self.set(connection, NOT_SUBSCRIBED);
        qos
    }
}

#[derive(Copy, Clone)]
pub struct TopicInfo {
    /// djb2 hash of the topic name; zero marks a free slot.
    pub hash: u32,
    pub qos: QosArray,
    /// Topic id assigned by the upstream gateway, zero if unregistered.
    pub gateway_topic_id: u16,
    /// QoS granted by the gateway, -1 while registration is in flight.
    pub gateway_qos: i8,
    /// Reference count of local subscriptions.
    pub subscribe_count: u8,
    pub retained_offset: u16,
    pub retained_length: u8,
    pub retained_allocated: u8,
}

impl TopicInfo {
    const FREE: TopicInfo = TopicInfo {
        hash: 0,
        qos: QosArray::all_unsubscribed(),
        gateway_topic_id: 0,
        gateway_qos: 0,
        subscribe_count: 0,
        retained_offset: 0,
        retained_length: 0,
        retained_allocated: 0,
    };
}

/// djb2, the hash the table is keyed by. Never returns zero so zero can
/// mark free slots.
pub fn topic_hash(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        hash = (hash << 5)
            .wrapping_add(hash)
            .wrapping_add(b as u32);
    }
    if hash == 0 {
        1
    } else {
        hash
    }
}

pub struct TopicTable {
    pub count: usize,
    pub topics: [TopicInfo; MAX_TOPIC_COUNT],
    pub retained_size: usize,
    pub retained: [u8; RETAINED_BUFFER_SIZE],
}

impl TopicTable {
    pub fn new() -> Self {
        Self {
            count: 0,
            topics: [TopicInfo::FREE; MAX_TOPIC_COUNT],
            retained_size: 0,
            retained: [0; RETAINED_BUFFER_SIZE],
        }
    }

    /// Finds a topic by name, optionally adding it. Free slots are reused
    /// before the table grows. `None` when the table is full.
    pub fn index_of(&mut self, name: &str, add: bool) -> Option<usize> {
        let hash = topic_hash(name);
        let mut empty = None;
        for i in (0..self.count).rev() {
            if self.topics[i].hash == hash {
                return Some(i);
            }
            if self.topics[i].hash == 0 {
                empty = Some(i);
            }
        }
        if !add {
            return None;
        }
        let slot = match empty {
            Some(i) => i,
            None => {
                if self.count >= MAX_TOPIC_COUNT {
                    return None;
                }
                self.count += 1;
                self.count - 1
            }
        };
        self.topics[slot] = TopicInfo {
            hash,
            ..TopicInfo::FREE
        };
        Some(slot)
    }

    /// Looks a topic up by the id the gateway uses for it.
    pub fn index_by_gateway_id(&self, gateway_topic_id: u16) -> Option<usize> {
        if gateway_topic_id == 0 {
            return None;
        }
        (0..self.count).find(|&i| {
            self.topics[i].hash != 0
                && self.topics[i].gateway_topic_id == gateway_topic_id
        })
    }

    /// True if `index` denotes a live topic.
    pub fn is_valid(&self, index: usize) -> bool {
        index < self.count && self.topics[index].hash != 0
    }

    /// Resets the per-topic QoS entries of one connection, for a fresh
    /// session.
    pub fn reset_connection(&mut self, connection: usize) {
        for i in 0..self.count {
            self.topics[i].qos.set(connection, 3);
        }
    }

    // retained arena -----------------------------------------------------

    /// Opens a `length`-byte gap at `offset`, shifting the arena tail and
    /// fixing up the offsets of every other topic at or behind the point.
    fn insert_retained(&mut self, offset: usize, length: usize) {
        self.retained
            .copy_within(offset..self.retained_size, offset + length);
        self.retained_size += length;
        for t in self.topics[..self.count].iter_mut() {
            if t.retained_offset as usize >= offset {
                t.retained_offset += length as u16;
            }
        }
    }

    fn erase_retained(&mut self, offset: usize, length: usize) {
        self.retained
            .copy_within(offset + length..self.retained_size, offset);
        self.retained_size -= length;
        for t in self.topics[..self.count].iter_mut() {
            if t.retained_offset as usize >= offset + length {
                t.retained_offset -= length as u16;
            }
        }
    }

    /// Stores, replaces, or (for an empty payload) erases the retained
    /// message of a topic. False when the arena or the per-topic length is
    /// exhausted.
    pub fn set_retained(&mut self, index: usize, payload: &[u8]) -> bool {
        let t = self.topics[index];
        if payload.is_empty() {
            if t.retained_allocated != 0 {
                self.erase_retained(
                    t.retained_offset as usize,
                    t.retained_allocated as usize,
                );
                let t = &mut self.topics[index];
                t.retained_offset = 0;
                t.retained_length = 0;
                t.retained_allocated = 0;
            }
            return true;
        }
        if payload.len() > u8::MAX as usize {
            return false;
        }
        if payload.len() > t.retained_allocated as usize {
            let grow = payload.len() - t.retained_allocated as usize;
            if self.retained_size + grow > RETAINED_BUFFER_SIZE {
                return false;
            }
            // grow in place; the fixup moves every other topic up, and the
            // target keeps its own offset
            let offset = if t.retained_allocated == 0 {
                // fresh allocation goes to the arena's end
                let offset = self.retained_size;
                self.retained_size += payload.len();
                offset
            } else {
                let offset = t.retained_offset as usize;
                self.insert_retained(offset + t.retained_allocated as usize, grow);
                offset
            };
            let t = &mut self.topics[index];
            t.retained_offset = offset as u16;
            t.retained_allocated = payload.len() as u8;
        }
        let t = &mut self.topics[index];
        t.retained_length = payload.len() as u8;
        let offset = t.retained_offset as usize;
        self.retained[offset..offset + payload.len()]
            .copy_from_slice(payload);
        true
    }

    pub fn retained(&self, index: usize) -> Option<&[u8]> {
        let t = &self.topics[index];
        if t.retained_length == 0 {
            return None;
        }
        let offset = t.retained_offset as usize;
        Some(&self.retained[offset..offset + t.retained_length as usize])
    }
}
