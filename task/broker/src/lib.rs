// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT-SN broker.
//!
//! One upstream connection (index 0, the gateway) and up to
//! [`MAX_CLIENT_COUNT`] downstream clients share a topic table, a retained
//! message arena, and a downlink send queue. Local publishers and
//! subscribers bind to topic indices and exchange typed messages; the wire
//! carries the short text forms from `message::text`.
//!
//! The broker is a set of cooperating coroutines, all spawned by the owner:
//!
//! - `receive_loop` parses every inbound PDU: client session management
//!   (CONNECT and the will exchange), topic registration, subscriptions
//!   with retained-message delivery, PUBLISH routing, and acknowledge
//!   dispatch into the [`AckWaitList`].
//! - `publish_loop` drains dirty publishers: local delivery first, then one
//!   PUBLISH per subscribed connection in round-robin order, each with
//!   PUBACK/retry discipline when the subscription QoS asks for it.
//! - `send_pump` pushes queued downlink messages out through the transport;
//!   `resend_loop` re-arms overdue unacknowledged records with the DUP flag
//!   and gives up after the retry budget.
//! - `ping_loop` keeps the gateway session alive and marks it down after
//!   too many missed PINGRESPs.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

mod ackwait;
mod sendqueue;
mod topics;

#[cfg(test)]
mod tests;

pub use ackwait::{AckData, AckWaitList};
pub use sendqueue::{ClientSet, SendQueue, MAX_SEND_COUNT, SEND_BUFFER_SIZE};
pub use topics::{
    topic_hash, QosArray, TopicTable, MAX_TOPIC_COUNT, NOT_SUBSCRIBED,
    RETAINED_BUFFER_SIZE,
};

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::net::SocketAddr;
use drv_timer::{Rtc, Timer};
use exec::{select2, Event, Select2};
use message::{convert, text, Message};
use mqttsn::{
    Flags, MsgType, Reader, ReturnCode, TopicType, Writer,
    MAX_MESSAGE_LENGTH,
};
use plug::{PlugInfo, SubscriberTarget};
use ringbuf::{ringbuf, ringbuf_entry};
use systime::{s, SystemDuration};

pub type Endpoint = SocketAddr;

/// Downstream clients; connection 0 is the gateway.
pub const MAX_CLIENT_COUNT: usize = 32;
pub const MAX_CONNECTION_COUNT: usize = 1 + MAX_CLIENT_COUNT;
pub const GATEWAY: usize = 0;

// connection sets travel in u64 bitmasks
static_assertions::const_assert!(MAX_CONNECTION_COUNT <= 64);

const MAX_RETRY: u32 = 2;
const RETRANSMISSION_TIME: SystemDuration = s(1);
const RECONNECT_TIME: SystemDuration = s(5);
const KEEP_ALIVE_TIME: SystemDuration = s(60);

/// Subscription QoS granted to clients and requested from the gateway.
const DEFAULT_QOS: u8 = 1;

const MAX_NAME_LENGTH: usize = 23;
const MAX_WILL_LENGTH: usize = 32;

/// Datagram transport under the broker; UDP on the emulator.
pub trait Transport {
    async fn send(&self, endpoint: Endpoint, data: &[u8]);
    async fn receive(&self, buffer: &mut [u8]) -> (Endpoint, usize);
}

impl<T: Transport + ?Sized> Transport for alloc::rc::Rc<T> {
    async fn send(&self, endpoint: Endpoint, data: &[u8]) {
        (**self).send(endpoint, data).await
    }

    async fn receive(&self, buffer: &mut [u8]) -> (Endpoint, usize) {
        (**self).receive(buffer).await
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    InvalidParameter,
    InvalidState,
    Busy,
    OutOfMemory,
    Timeout,
    ProtocolError,
    Rejected,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum WillState {
    #[default]
    None,
    AwaitTopic,
    AwaitMessage,
}

#[derive(Clone, Default)]
struct ConnectionInfo {
    endpoint: Option<Endpoint>,
    name: heapless::String<MAX_NAME_LENGTH>,
    will_state: WillState,
    will_topic: heapless::String<MAX_WILL_LENGTH>,
    will_message: heapless::Vec<u8, MAX_WILL_LENGTH>,
}

struct PublisherState {
    topic_index: usize,
    message: Option<Message>,
    dirty: bool,
}

struct SubscriberState {
    topic_index: usize,
    subscription_index: u8,
    target: SubscriberTarget,
}

struct BrokerState {
    connections: [ConnectionInfo; MAX_CONNECTION_COUNT],
    connected: u64,
    topics: TopicTable,
    next_msg_id: u16,
    publishers: Vec<PublisherState>,
    subscribers: Vec<SubscriberState>,
    current_publisher: Option<usize>,
    dirty_connections: u64,
    send_queue: SendQueue,
    own_will: Option<(
        heapless::String<MAX_WILL_LENGTH>,
        heapless::Vec<u8, MAX_WILL_LENGTH>,
    )>,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    ClientConnected(usize),
    ConnectionsFull,
    GatewayUp,
    GatewayDown,
    Registered(u16),
    PublishIn(usize),
    PublishOut(usize, u16),
    Malformed,
    WillStored(usize),
}

ringbuf!(Trace, 32, Trace::None);

pub struct Broker<T: Transport, R: Rtc> {
    transport: T,
    timer: Rc<Timer<R>>,
    st: RefCell<BrokerState>,
    publish_event: Event,
    send_event: Event,
    acks: AckWaitList,
}

/// Handle for publishing typed messages on one topic.
pub struct Publisher<T: Transport, R: Rtc> {
    broker: Rc<Broker<T, R>>,
    index: usize,
}

impl<T: Transport, R: Rtc> Publisher<T, R> {
    pub fn publish(&self, message: Message) {
        let mut st = self.broker.st.borrow_mut();
        let p = &mut st.publishers[self.index];
        p.message = Some(message);
        p.dirty = true;
        drop(st);
        self.broker.publish_event.set();
    }
}

impl<T: Transport, R: Rtc> Broker<T, R> {
    pub fn new(transport: T, timer: Rc<Timer<R>>) -> Self {
        Self {
            transport,
            timer,
            st: RefCell::new(BrokerState {
                connections: core::array::from_fn(|_| {
                    ConnectionInfo::default()
                }),
                connected: 0,
                topics: TopicTable::new(),
                next_msg_id: 0,
                publishers: Vec::new(),
                subscribers: Vec::new(),
                current_publisher: None,
                dirty_connections: 0,
                send_queue: SendQueue::new(),
                own_will: None,
            }),
            publish_event: Event::new(),
            send_event: Event::new(),
            acks: AckWaitList::new(),
        }
    }

    // local bindings -----------------------------------------------------

    /// Binds a publisher to `topic`. Registration at the gateway happens
    /// separately via [`Broker::register_with_gateway`].
    pub fn add_publisher(
        self: &Rc<Self>,
        topic: &str,
    ) -> Result<Publisher<T, R>, Error> {
        if topic.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let mut st = self.st.borrow_mut();
        let topic_index = st
            .topics
            .index_of(topic, true)
            .ok_or(Error::OutOfMemory)?;
        st.publishers.push(PublisherState {
            topic_index,
            message: None,
            dirty: false,
        });
        let index = st.publishers.len() - 1;
        Ok(Publisher {
            broker: self.clone(),
            index,
        })
    }

    /// Binds a subscriber target to `topic` and delivers the retained
    /// message, if any, right away.
    pub fn add_subscriber(
        &self,
        topic: &str,
        subscription_index: u8,
        target: SubscriberTarget,
    ) -> Result<(), Error> {
        if topic.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let mut st = self.st.borrow_mut();
        let topic_index = st
            .topics
            .index_of(topic, true)
            .ok_or(Error::OutOfMemory)?;
        st.topics.topics[topic_index].subscribe_count += 1;
        st.subscribers.push(SubscriberState {
            topic_index,
            subscription_index,
            target,
        });
        if let Some(retained) = st.topics.retained(topic_index) {
            let sub = st.subscribers.last().unwrap();
            if let Ok(payload) = core::str::from_utf8(retained) {
                if let Some(m) =
                    text::parse(sub.target.message_type, payload)
                {
                    sub.target.barrier.resume_first((
                        PlugInfo {
                            element_id: 0,
                            plug_index: sub.target.plug_index,
                            source_index: subscription_index,
                        },
                        m,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Drops every subscription delivering to `barrier` and unsubscribes
    /// topics whose reference count drops to zero.
    pub fn remove_subscriber(&self, barrier: &Rc<plug::PlugBarrier>) {
        let mut st = self.st.borrow_mut();
        let mut i = 0;
        while i < st.subscribers.len() {
            if Rc::ptr_eq(&st.subscribers[i].target.barrier, barrier) {
                let topic_index = st.subscribers[i].topic_index;
                let t = &mut st.topics.topics[topic_index];
                t.subscribe_count = t.subscribe_count.saturating_sub(1);
                st.subscribers.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // gateway session ----------------------------------------------------

    /// Connects to the gateway, retrying up to `MAX_RETRY` times. On
    /// success every per-topic gateway QoS entry is reset, so topics must
    /// be registered and subscribed again.
    pub async fn connect(
        self: &Rc<Self>,
        endpoint: Endpoint,
        name: &str,
        clean_session: bool,
        will: Option<(&str, &[u8])>,
    ) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(Error::InvalidParameter);
        }
        {
            let mut st = self.st.borrow_mut();
            // provisionally connected so the CONNACK passes the pump
            st.connections[GATEWAY].endpoint = Some(endpoint);
            st.connected |= 1 << GATEWAY;
            st.own_will = will.and_then(|(topic, msg)| {
                let mut t = heapless::String::new();
                t.push_str(topic).ok()?;
                let m = heapless::Vec::from_slice(msg).ok()?;
                Some((t, m))
            });
        }

        let mut flags = Flags::default();
        if clean_session {
            flags = flags.set(Flags::CLEAN_SESSION);
        }
        if will.is_some() {
            flags = flags.set(Flags::WILL);
        }

        for _retry in 0..=MAX_RETRY {
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Connect)
                    .flags(flags)
                    .u8(0x01)
                    .u16(KEEP_ALIVE_TIME.to_seconds() as u16)
                    .string(name);
            })
            .await;

            let outcome = select2(
                self.acks.wait(GATEWAY, MsgType::Connack, 0),
                self.timer.sleep_for(RECONNECT_TIME),
            )
            .await;
            if let Select2::First(data) = outcome {
                if data.first() == Some(&(ReturnCode::Accepted as u8)) {
                    ringbuf_entry!(Trace::GatewayUp);
                    let mut st = self.st.borrow_mut();
                    st.topics.reset_connection(GATEWAY);
                    return Ok(());
                }
            }
        }

        self.st.borrow_mut().connected &= !(1 << GATEWAY);
        Err(Error::Timeout)
    }

    pub async fn disconnect(self: &Rc<Self>) {
        let endpoint = self.connection_endpoint(GATEWAY);
        if let Some(endpoint) = endpoint {
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Disconnect);
            })
            .await;
        }
        self.st.borrow_mut().connected &= !(1 << GATEWAY);
    }

    pub fn is_gateway_connected(&self) -> bool {
        self.st.borrow().connected & 1 << GATEWAY != 0
    }

    /// Registers `topic` at the gateway so local publishes reach it.
    pub async fn register_with_gateway(
        self: &Rc<Self>,
        topic: &str,
    ) -> Result<(), Error> {
        let Some(endpoint) = self.connection_endpoint(GATEWAY) else {
            return Err(Error::InvalidState);
        };
        let topic_index = {
            let mut st = self.st.borrow_mut();
            let index = st
                .topics
                .index_of(topic, true)
                .ok_or(Error::OutOfMemory)?;
            if st.topics.topics[index].gateway_topic_id != 0
                || st.connected & 1 << GATEWAY == 0
            {
                return Ok(());
            }
            index
        };

        let msg_id = self.next_msg_id();
        for _retry in 0..=MAX_RETRY {
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Register)
                    .u16(0)
                    .u16(msg_id)
                    .string(topic);
            })
            .await;

            let outcome = select2(
                self.acks.wait(GATEWAY, MsgType::Regack, msg_id),
                self.timer.sleep_for(RETRANSMISSION_TIME),
            )
            .await;
            if !self.is_gateway_connected() {
                return Err(Error::InvalidState);
            }
            if let Select2::First(data) = outcome {
                // REGACK: topic id, msg id, return code
                if data.len() >= 5 && data[4] == ReturnCode::Accepted as u8
                {
                    let topic_id =
                        (data[0] as u16) << 8 | data[1] as u16;
                    ringbuf_entry!(Trace::Registered(topic_id));
                    let mut st = self.st.borrow_mut();
                    let t = &mut st.topics.topics[topic_index];
                    t.gateway_topic_id = topic_id;
                    t.qos.set(GATEWAY, DEFAULT_QOS);
                    return Ok(());
                }
                return Err(Error::Rejected);
            }
        }
        Err(Error::Timeout)
    }

    /// Subscribes to `topic` at the gateway so its publishes reach us.
    pub async fn subscribe_with_gateway(
        self: &Rc<Self>,
        topic: &str,
    ) -> Result<(), Error> {
        let Some(endpoint) = self.connection_endpoint(GATEWAY) else {
            return Err(Error::InvalidState);
        };
        let topic_index = {
            let mut st = self.st.borrow_mut();
            let index = st
                .topics
                .index_of(topic, true)
                .ok_or(Error::OutOfMemory)?;
            if st.topics.topics[index].qos.get(GATEWAY) != NOT_SUBSCRIBED
                || st.connected & 1 << GATEWAY == 0
            {
                return Ok(());
            }
            index
        };

        let msg_id = self.next_msg_id();
        let flags = Flags::default()
            .with_qos(DEFAULT_QOS as i8)
            .with_topic_type(TopicType::Normal);
        for _retry in 0..=MAX_RETRY {
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Subscribe)
                    .flags(flags)
                    .u16(msg_id)
                    .string(topic);
            })
            .await;

            let outcome = select2(
                self.acks.wait(GATEWAY, MsgType::Suback, msg_id),
                self.timer.sleep_for(RETRANSMISSION_TIME),
            )
            .await;
            if !self.is_gateway_connected() {
                return Err(Error::InvalidState);
            }
            if let Select2::First(data) = outcome {
                // SUBACK: flags, topic id, msg id, return code
                if data.len() >= 6 && data[5] == ReturnCode::Accepted as u8
                {
                    let granted = mqttsn::get_qos(data[0]);
                    let topic_id =
                        (data[1] as u16) << 8 | data[2] as u16;
                    let mut st = self.st.borrow_mut();
                    let t = &mut st.topics.topics[topic_index];
                    t.gateway_topic_id = topic_id;
                    t.gateway_qos = granted;
                    t.qos.set(GATEWAY, granted.max(0) as u8);
                    return Ok(());
                }
                return Err(Error::Rejected);
            }
        }
        Err(Error::Timeout)
    }

    /// Withdraws a gateway subscription once the last local reference to
    /// `topic` is gone.
    pub async fn unsubscribe_with_gateway(
        self: &Rc<Self>,
        topic: &str,
    ) -> Result<(), Error> {
        let Some(endpoint) = self.connection_endpoint(GATEWAY) else {
            return Err(Error::InvalidState);
        };
        {
            let mut st = self.st.borrow_mut();
            let Some(index) = st.topics.index_of(topic, false) else {
                return Err(Error::InvalidParameter);
            };
            let connected = st.connected;
            let t = &mut st.topics.topics[index];
            if t.subscribe_count > 0
                || t.qos.get(GATEWAY) == NOT_SUBSCRIBED
                || connected & 1 << GATEWAY == 0
            {
                return Ok(());
            }
            t.qos.set(GATEWAY, NOT_SUBSCRIBED);
            t.gateway_qos = 0;
        }

        let msg_id = self.next_msg_id();
        let flags = Flags::default().with_topic_type(TopicType::Normal);
        for _retry in 0..=MAX_RETRY {
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Unsubscribe)
                    .flags(flags)
                    .u16(msg_id)
                    .string(topic);
            })
            .await;

            let outcome = select2(
                self.acks.wait(GATEWAY, MsgType::Unsuback, msg_id),
                self.timer.sleep_for(RETRANSMISSION_TIME),
            )
            .await;
            if matches!(outcome, Select2::First(_)) {
                return Ok(());
            }
            if !self.is_gateway_connected() {
                return Err(Error::InvalidState);
            }
        }
        Err(Error::Timeout)
    }

    /// Drops a client connection and publishes its stored will, if any.
    pub fn drop_connection(&self, connection: usize) {
        let mut st = self.st.borrow_mut();
        st.connected &= !(1 << connection);
        let will_topic = st.connections[connection].will_topic.clone();
        let will_message =
            st.connections[connection].will_message.clone();
        st.connections[connection] = ConnectionInfo::default();
        if !will_topic.is_empty() {
            if let Some(topic_index) =
                st.topics.index_of(&will_topic, true)
            {
                self.deliver_local_text(&st, topic_index, &will_message);
                self.enqueue_forward(
                    &mut st,
                    topic_index,
                    &will_message,
                    connection,
                    false,
                );
            }
        }
        drop(st);
        self.send_event.set();
    }

    // coroutines ---------------------------------------------------------

    /// Keep-alive supervision of the gateway link.
    pub async fn ping_loop(self: Rc<Self>) {
        while self.is_gateway_connected() {
            self.timer.sleep_for(KEEP_ALIVE_TIME).await;
            let Some(endpoint) = self.connection_endpoint(GATEWAY) else {
                break;
            };
            let mut alive = false;
            for _retry in 0..MAX_RETRY {
                self.send_pdu(endpoint, |w| {
                    w.msg_type(MsgType::Pingreq);
                })
                .await;
                let outcome = select2(
                    self.acks.wait(GATEWAY, MsgType::Pingresp, 0),
                    self.timer.sleep_for(RETRANSMISSION_TIME),
                )
                .await;
                if matches!(outcome, Select2::First(_)) {
                    alive = true;
                    break;
                }
            }
            if !alive {
                ringbuf_entry!(Trace::GatewayDown);
                self.st.borrow_mut().connected &= !(1 << GATEWAY);
            }
        }
    }

    /// Drains the downlink send queue through the transport.
    pub async fn send_pump(self: Rc<Self>) {
        loop {
            self.send_event.wait().await;
            loop {
                let next = self.st.borrow_mut().send_queue.take_next();
                let Some((clients, msg_id, data)) = next else {
                    break;
                };
                for client in clients.iter() {
                    let endpoint = {
                        let st = self.st.borrow();
                        if st.connected & 1 << client != 0 {
                            st.connections[client].endpoint
                        } else {
                            None
                        }
                    };
                    match endpoint {
                        Some(endpoint) => {
                            self.transport
                                .send(endpoint, &data)
                                .await;
                        }
                        None => {
                            if msg_id != 0 {
                                self.st
                                    .borrow_mut()
                                    .send_queue
                                    .remove_sent(msg_id, client);
                            }
                        }
                    }
                }
            }
            self.send_event.clear();
        }
    }

    /// Re-arms overdue unacknowledged downlink messages with the DUP flag
    /// and drops them once the retry budget is spent.
    pub async fn resend_loop(self: Rc<Self>) {
        loop {
            self.timer.sleep_for(RETRANSMISSION_TIME).await;
            let now = self.timer.now();
            let again = self.st.borrow_mut().send_queue.resend_overdue(
                now,
                RETRANSMISSION_TIME,
                RETRANSMISSION_TIME * (MAX_RETRY as i32 + 1),
            );
            if again {
                self.send_event.set();
            }
        }
    }

    /// Routes dirty publishers: local subscribers first, then one PUBLISH
    /// per subscribed connection with acknowledge discipline.
    pub async fn publish_loop(self: Rc<Self>) {
        loop {
            self.publish_event.wait().await;

            // the borrow must not survive into the sends below
            let current = self.st.borrow().current_publisher;
            if let Some(publisher) = current {
                loop {
                    let Some(connection) = self.next_dirty_connection()
                    else {
                        break;
                    };
                    self.publish_to_connection(publisher, connection)
                        .await;
                }
                self.st.borrow_mut().current_publisher = None;
            }

            // local delivery, then pick the next dirty publisher
            let mut st = self.st.borrow_mut();
            let next = st
                .publishers
                .iter()
                .position(|p| p.dirty);
            match next {
                Some(i) => {
                    st.publishers[i].dirty = false;
                    if let Some(msg) = st.publishers[i].message {
                        let topic_index = st.publishers[i].topic_index;
                        self.deliver_local_message(
                            &st,
                            topic_index,
                            &msg,
                        );
                    }
                    st.current_publisher = Some(i);
                    st.dirty_connections = !0;
                }
                None => {
                    self.publish_event.clear();
                }
            }
        }
    }

    /// Parses every inbound datagram.
    pub async fn receive_loop(self: Rc<Self>) {
        let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
        loop {
            let (source, length) =
                self.transport.receive(&mut buffer).await;
            self.handle_datagram(source, &buffer[..length]).await;
        }
    }

    // internals ----------------------------------------------------------

    fn next_msg_id(&self) -> u16 {
        Self::next_msg_id_in(&mut self.st.borrow_mut())
    }

    fn next_msg_id_in(st: &mut BrokerState) -> u16 {
        st.next_msg_id = if st.next_msg_id == 0xffff {
            1
        } else {
            st.next_msg_id + 1
        };
        st.next_msg_id
    }

    fn connection_endpoint(&self, connection: usize) -> Option<Endpoint> {
        self.st.borrow().connections[connection].endpoint
    }

    fn connection_by_endpoint(&self, endpoint: Endpoint) -> Option<usize> {
        let st = self.st.borrow();
        (0..MAX_CONNECTION_COUNT).find(|&i| {
            st.connected & 1 << i != 0
                && st.connections[i].endpoint == Some(endpoint)
        })
    }

    async fn send_pdu(
        &self,
        endpoint: Endpoint,
        build: impl FnOnce(&mut Writer<'_>),
    ) {
        let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
        let mut w = Writer::new(&mut buffer);
        build(&mut w);
        match w.finish() {
            Some(pdu) => self.transport.send(endpoint, pdu).await,
            None => ringbuf_entry!(Trace::Malformed),
        }
    }

    fn next_dirty_connection(&self) -> Option<usize> {
        let mut st = self.st.borrow_mut();
        let mask = st.dirty_connections & st.connected;
        if mask == 0 {
            return None;
        }
        let connection = mask.trailing_zeros() as usize;
        st.dirty_connections &= !(1 << connection);
        Some(connection)
    }

    async fn publish_to_connection(
        &self,
        publisher: usize,
        connection: usize,
    ) {
        let (endpoint, topic_id, qos, payload) = {
            let st = self.st.borrow();
            let p = &st.publishers[publisher];
            let topic = &st.topics.topics[p.topic_index];
            let qos = topic.qos.get(connection);
            if qos == NOT_SUBSCRIBED {
                return;
            }
            let topic_id = if connection == GATEWAY {
                topic.gateway_topic_id
            } else {
                (p.topic_index + 1) as u16
            };
            if topic_id == 0 {
                return;
            }
            let Some(message) = &p.message else { return };
            let Some(payload) = text::write(message) else { return };
            let Some(endpoint) = st.connections[connection].endpoint
            else {
                return;
            };
            (endpoint, topic_id, qos, payload)
        };

        let msg_id = if qos == 0 { 0 } else { self.next_msg_id() };
        let mut flags = Flags::default()
            .with_qos(qos as i8)
            .with_topic_type(TopicType::Normal);
        for _retry in 0..=MAX_RETRY {
            ringbuf_entry!(Trace::PublishOut(connection, msg_id));
            self.send_pdu(endpoint, |w| {
                w.msg_type(MsgType::Publish)
                    .flags(flags)
                    .u16(topic_id)
                    .u16(msg_id)
                    .string(&payload);
            })
            .await;
            if qos == 0 {
                return;
            }
            let outcome = select2(
                self.acks.wait(connection, MsgType::Puback, msg_id),
                self.timer.sleep_for(RETRANSMISSION_TIME),
            )
            .await;
            let still_connected = self.st.borrow().connected
                & 1 << connection
                != 0;
            if !still_connected {
                return;
            }
            if let Select2::First(data) = outcome {
                // PUBACK: topic id, msg id, return code
                if data.len() >= 5
                    && data[4] == ReturnCode::Accepted as u8
                {
                    return;
                }
            }
            flags = flags.set(Flags::DUP);
        }
    }

    fn deliver_local_message(
        &self,
        st: &BrokerState,
        topic_index: usize,
        message: &Message,
    ) {
        for sub in &st.subscribers {
            if sub.topic_index != topic_index {
                continue;
            }
            let Some(m) = convert(sub.target.message_type, message)
            else {
                continue;
            };
            sub.target.barrier.resume_first((
                PlugInfo {
                    element_id: 0,
                    plug_index: sub.target.plug_index,
                    source_index: sub.subscription_index,
                },
                m,
            ));
        }
    }

    fn deliver_local_text(
        &self,
        st: &BrokerState,
        topic_index: usize,
        payload: &[u8],
    ) {
        let Ok(payload) = core::str::from_utf8(payload) else {
            return;
        };
        for sub in &st.subscribers {
            if sub.topic_index != topic_index {
                continue;
            }
            let Some(m) = text::parse(sub.target.message_type, payload)
            else {
                continue;
            };
            sub.target.barrier.resume_first((
                PlugInfo {
                    element_id: 0,
                    plug_index: sub.target.plug_index,
                    source_index: sub.subscription_index,
                },
                m,
            ));
        }
    }

    /// Queues a PUBLISH to every other connection subscribed to the topic.
    fn enqueue_forward(
        &self,
        st: &mut BrokerState,
        topic_index: usize,
        payload: &[u8],
        exclude: usize,
        retain: bool,
    ) {
        let mut clients = ClientSet(0);
        let mut max_qos = 0u8;
        for i in 0..MAX_CONNECTION_COUNT {
            if i == exclude || st.connected & 1 << i == 0 {
                continue;
            }
            let qos = st.topics.topics[topic_index].qos.get(i);
            if qos == NOT_SUBSCRIBED {
                continue;
            }
            if i == GATEWAY
                && st.topics.topics[topic_index].gateway_topic_id == 0
            {
                continue;
            }
            clients.0 |= 1 << i;
            max_qos = max_qos.max(qos);
        }
        if clients.is_empty() {
            return;
        }

        // the gateway uses its own topic id; other connections use ours,
        // so the gateway gets its own record
        let local_id = (topic_index + 1) as u16;
        let gateway_id = st.topics.topics[topic_index].gateway_topic_id;
        let now = self.timer.now();
        for (set, topic_id) in [
            (ClientSet(clients.0 & 1), gateway_id),
            (ClientSet(clients.0 & !1), local_id),
        ] {
            if set.is_empty() {
                continue;
            }
            let msg_id = if max_qos == 0 {
                0
            } else {
                Self::next_msg_id_in(st)
            };
            let mut flags = Flags::default()
                .with_qos(max_qos.min(DEFAULT_QOS) as i8)
                .with_topic_type(TopicType::Normal);
            if retain {
                flags = flags.set(Flags::RETAIN);
            }
            let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
            let mut w = Writer::new(&mut buffer);
            w.msg_type(MsgType::Publish)
                .flags(flags)
                .u16(topic_id)
                .u16(msg_id)
                .data(payload);
            if let Some(pdu) = w.finish() {
                st.send_queue.enqueue(set, pdu, msg_id, now);
            }
        }
    }

    async fn handle_datagram(
        &self,
        source: Endpoint,
        datagram: &[u8],
    ) {
        let Some(mut r) = Reader::new(datagram) else {
            ringbuf_entry!(Trace::Malformed);
            return;
        };
        let Some(msg_type) = r.msg_type() else {
            ringbuf_entry!(Trace::Malformed);
            return;
        };
        // the reply dispatch needs the body behind the message type
        let body: heapless::Vec<u8, MAX_MESSAGE_LENGTH> = {
            let mut body_reader = r.clone();
            heapless::Vec::from_slice(body_reader.rest())
                .unwrap_or_default()
        };
        let connection = self.connection_by_endpoint(source);

        if connection.is_none() && msg_type != MsgType::Connect {
            // unknown peer: tell it to go away
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::Disconnect);
            })
            .await;
            return;
        }

        match msg_type {
            MsgType::Connect => {
                self.handle_connect(source, connection, r).await;
            }
            MsgType::WillTopic => {
                self.handle_will_topic(source, connection, r).await;
            }
            MsgType::WillMsg => {
                self.handle_will_msg(source, connection, r).await;
            }
            MsgType::Register => {
                self.handle_register(source, connection, r).await;
            }
            MsgType::Subscribe => {
                self.handle_subscribe(source, connection, r).await;
            }
            MsgType::Unsubscribe => {
                self.handle_unsubscribe(source, connection, r).await;
            }
            MsgType::Publish => {
                self.handle_publish(source, connection, r).await;
            }
            MsgType::Pingreq => {
                self.send_pdu(source, |w| {
                    w.msg_type(MsgType::Pingresp);
                })
                .await;
            }
            MsgType::WillTopicReq => {
                self.answer_will_topic(source).await;
            }
            MsgType::WillMsgReq => {
                self.answer_will_msg(source).await;
            }
            MsgType::Disconnect => {
                let Some(connection) = connection else { return };
                if connection == GATEWAY {
                    ringbuf_entry!(Trace::GatewayDown);
                    self.st.borrow_mut().connected &= !(1 << GATEWAY);
                } else {
                    // clean disconnect: the will is discarded
                    let mut st = self.st.borrow_mut();
                    st.connected &= !(1 << connection);
                    st.connections[connection] =
                        ConnectionInfo::default();
                    drop(st);
                    self.send_pdu(source, |w| {
                        w.msg_type(MsgType::Disconnect);
                    })
                    .await;
                }
            }
            MsgType::Connack
            | MsgType::Regack
            | MsgType::Suback
            | MsgType::Unsuback
            | MsgType::Puback
            | MsgType::Pingresp => {
                self.handle_ack(connection, msg_type, r, &body);
            }
            _ => {}
        }
    }

    async fn handle_connect(
        &self,
        source: Endpoint,
        existing: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let flags = r.flags();
        let _protocol_id = r.u8();
        let _duration = r.u16();
        let name = r.string();
        if !r.is_valid() {
            ringbuf_entry!(Trace::Malformed);
            return;
        }

        let slot = existing.filter(|&c| c != GATEWAY).or_else(|| {
            let st = self.st.borrow();
            (1..MAX_CONNECTION_COUNT)
                .find(|&i| st.connected & 1 << i == 0)
        });
        let Some(slot) = slot else {
            ringbuf_entry!(Trace::ConnectionsFull);
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::Connack)
                    .return_code(ReturnCode::RejectedCongested);
            })
            .await;
            return;
        };

        let will = flags.contains(Flags::WILL);
        {
            let mut st = self.st.borrow_mut();
            let c = &mut st.connections[slot];
            *c = ConnectionInfo::default();
            c.endpoint = Some(source);
            c.name.push_str(name).ok();
            c.will_state = if will {
                WillState::AwaitTopic
            } else {
                WillState::None
            };
            st.connected |= 1 << slot;
            st.topics.reset_connection(slot);
        }
        ringbuf_entry!(Trace::ClientConnected(slot));

        if will {
            // will exchange first; CONNACK follows after WILLMSG
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::WillTopicReq);
            })
            .await;
        } else {
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::Connack)
                    .return_code(ReturnCode::Accepted);
            })
            .await;
        }
    }

    async fn handle_will_topic(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let _flags = r.flags();
        let topic = r.string();
        if !r.is_valid() {
            return;
        }
        {
            let mut st = self.st.borrow_mut();
            let c = &mut st.connections[connection];
            if c.will_state != WillState::AwaitTopic {
                return;
            }
            c.will_topic.clear();
            c.will_topic.push_str(topic).ok();
            c.will_state = WillState::AwaitMessage;
        }
        self.send_pdu(source, |w| {
            w.msg_type(MsgType::WillMsgReq);
        })
        .await;
    }

    async fn handle_will_msg(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let message = r.rest();
        {
            let mut st = self.st.borrow_mut();
            let c = &mut st.connections[connection];
            if c.will_state != WillState::AwaitMessage {
                return;
            }
            c.will_message.clear();
            c.will_message
                .extend_from_slice(
                    &message[..message.len().min(MAX_WILL_LENGTH)],
                )
                .ok();
            c.will_state = WillState::None;
        }
        ringbuf_entry!(Trace::WillStored(connection));
        self.send_pdu(source, |w| {
            w.msg_type(MsgType::Connack)
                .return_code(ReturnCode::Accepted);
        })
        .await;
    }

    async fn handle_register(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let topic_id = r.u16();
        let msg_id = r.u16();
        let name = r.string();
        if !r.is_valid() || name.is_empty() {
            ringbuf_entry!(Trace::Malformed);
            return;
        }

        let (reply_id, code) = {
            let mut st = self.st.borrow_mut();
            match st.topics.index_of(name, true) {
                None => (topic_id, ReturnCode::RejectedCongested),
                Some(index) => {
                    if connection == GATEWAY {
                        let t = &mut st.topics.topics[index];
                        if t.gateway_topic_id != 0
                            && t.gateway_topic_id != topic_id
                        {
                            // conflicting re-registration is an invalid
                            // parameter, not a crash
                            (topic_id, ReturnCode::RejectedInvalidTopicId)
                        } else {
                            t.gateway_topic_id = topic_id;
                            (topic_id, ReturnCode::Accepted)
                        }
                    } else {
                        ((index + 1) as u16, ReturnCode::Accepted)
                    }
                }
            }
        };

        self.send_pdu(source, |w| {
            w.msg_type(MsgType::Regack)
                .u16(reply_id)
                .u16(msg_id)
                .return_code(code);
        })
        .await;
    }

    async fn handle_subscribe(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let flags = r.flags();
        let msg_id = r.u16();
        let topic = r.string();
        if !r.is_valid() || topic.is_empty() {
            ringbuf_entry!(Trace::Malformed);
            return;
        }

        if connection == GATEWAY {
            // the gateway does not subscribe down here
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::Suback)
                    .flags(Flags::default())
                    .u16(0)
                    .u16(msg_id)
                    .return_code(ReturnCode::NotSupported);
            })
            .await;
            return;
        }

        let granted = flags.qos().max(0).min(DEFAULT_QOS as i8) as u8;
        let (topic_id, code, deliver_retained) = {
            let mut st = self.st.borrow_mut();
            match st.topics.index_of(topic, true) {
                None => (0, ReturnCode::RejectedCongested, false),
                Some(index) => {
                    st.topics.topics[index].qos.set(connection, granted);
                    (
                        (index + 1) as u16,
                        ReturnCode::Accepted,
                        st.topics.retained(index).is_some(),
                    )
                }
            }
        };

        self.send_pdu(source, |w| {
            w.msg_type(MsgType::Suback)
                .flags(Flags::default().with_qos(granted as i8))
                .u16(topic_id)
                .u16(msg_id)
                .return_code(code);
        })
        .await;

        // the retained message follows the SUBACK
        if deliver_retained {
            let now = self.timer.now();
            let mut st = self.st.borrow_mut();
            let index = topic_id as usize - 1;
            let payload: heapless::Vec<u8, MAX_MESSAGE_LENGTH> =
                match st.topics.retained(index) {
                    Some(p) => heapless::Vec::from_slice(p)
                        .unwrap_or_default(),
                    None => return,
                };
            let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
            let mut w = Writer::new(&mut buffer);
            w.msg_type(MsgType::Publish)
                .flags(
                    Flags::default()
                        .set(Flags::RETAIN)
                        .with_topic_type(TopicType::Normal),
                )
                .u16(topic_id)
                .u16(0)
                .data(&payload);
            if let Some(pdu) = w.finish() {
                st.send_queue.enqueue(
                    ClientSet::single(connection),
                    pdu,
                    0,
                    now,
                );
            }
            drop(st);
            self.send_event.set();
        }
    }

    async fn handle_unsubscribe(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let _flags = r.flags();
        let msg_id = r.u16();
        let topic = r.string();
        if !r.is_valid() {
            return;
        }
        if connection != GATEWAY {
            let mut st = self.st.borrow_mut();
            if let Some(index) = st.topics.index_of(topic, false) {
                st.topics.topics[index].qos.clear(connection);
            }
        }
        self.send_pdu(source, |w| {
            w.msg_type(MsgType::Unsuback).u16(msg_id);
        })
        .await;
    }

    async fn handle_publish(
        &self,
        source: Endpoint,
        connection: Option<usize>,
        mut r: Reader<'_>,
    ) {
        let Some(connection) = connection else { return };
        let flags = r.flags();
        let topic_id = r.u16();
        let msg_id = r.u16();
        let payload = r.rest();
        if !r.is_valid() {
            ringbuf_entry!(Trace::Malformed);
            return;
        }

        let index = {
            let st = self.st.borrow();
            if connection == GATEWAY {
                st.topics.index_by_gateway_id(topic_id)
            } else {
                (topic_id as usize)
                    .checked_sub(1)
                    .filter(|&i| st.topics.is_valid(i))
            }
        };

        if flags.qos() >= 1 || index.is_none() {
            let code = if index.is_some() {
                ReturnCode::Accepted
            } else {
                ReturnCode::RejectedInvalidTopicId
            };
            self.send_pdu(source, |w| {
                w.msg_type(MsgType::Puback)
                    .u16(topic_id)
                    .u16(msg_id)
                    .return_code(code);
            })
            .await;
        }
        let Some(index) = index else { return };
        ringbuf_entry!(Trace::PublishIn(index));

        let mut st = self.st.borrow_mut();
        if flags.contains(Flags::RETAIN) {
            st.topics.set_retained(index, payload);
        }
        if !payload.is_empty() {
            self.deliver_local_text(&st, index, payload);
            self.enqueue_forward(
                &mut st,
                index,
                payload,
                connection,
                false,
            );
        }
        drop(st);
        self.send_event.set();
    }

    fn handle_ack(
        &self,
        connection: Option<usize>,
        msg_type: MsgType,
        mut r: Reader<'_>,
        body: &[u8],
    ) {
        let Some(connection) = connection else { return };
        let msg_id = match msg_type {
            MsgType::Connack | MsgType::Pingresp => 0,
            MsgType::Regack | MsgType::Puback => {
                r.skip(2);
                r.u16()
            }
            MsgType::Suback => {
                r.skip(3);
                r.u16()
            }
            MsgType::Unsuback => r.u16(),
            _ => return,
        };
        if !r.is_valid() {
            ringbuf_entry!(Trace::Malformed);
            return;
        }
        if msg_type == MsgType::Puback {
            self.st
                .borrow_mut()
                .send_queue
                .remove_sent(msg_id, connection);
        }
        self.acks.resume_one(connection, msg_type, msg_id, body);
    }

    async fn answer_will_topic(&self, source: Endpoint) {
        let topic = {
            let st = self.st.borrow();
            st.own_will.as_ref().map(|(topic, _)| topic.clone())
        };
        let Some(topic) = topic else { return };
        self.send_pdu(source, |w| {
            w.msg_type(MsgType::WillTopic)
                .flags(Flags::default())
                .string(&topic);
        })
        .await;
    }

    async fn answer_will_msg(&self, source: Endpoint) {
        let message = {
            let st = self.st.borrow();
            st.own_will.as_ref().map(|(_, message)| message.clone())
        };
        let Some(message) = message else { return };
        self.send_pdu(source, |w| {
            w.msg_type(MsgType::WillMsg).data(&message);
        })
        .await;
    }
}
