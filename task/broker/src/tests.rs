// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use core::cell::Cell;
use core::net::{IpAddr, Ipv4Addr};
use core::task::Poll;
use exec::Executor;
use message::MessageType;
use plug::PlugBarrier;
use std::collections::VecDeque;
use std::vec::Vec as StdVec;

fn ep(port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

const GW: u16 = 47193;
const CLIENT_A: u16 = 50001;
const CLIENT_B: u16 = 50002;

#[derive(Default)]
struct TestTransport {
    inbox: RefCell<VecDeque<(Endpoint, StdVec<u8>)>>,
    outbox: RefCell<StdVec<(Endpoint, StdVec<u8>)>>,
    wakers: exec::WakerSet,
}

impl TestTransport {
    fn deliver(&self, source: Endpoint, data: &[u8]) {
        self.inbox.borrow_mut().push_back((source, data.to_vec()));
        self.wakers.wake_all();
    }

    fn took(&self) -> StdVec<(Endpoint, StdVec<u8>)> {
        self.outbox.borrow_mut().drain(..).collect()
    }
}

impl Transport for TestTransport {
    async fn send(&self, endpoint: Endpoint, data: &[u8]) {
        self.outbox.borrow_mut().push((endpoint, data.to_vec()));
    }

    async fn receive(&self, buffer: &mut [u8]) -> (Endpoint, usize) {
        core::future::poll_fn(|cx| {
            let mut inbox = self.inbox.borrow_mut();
            match inbox.pop_front() {
                Some((endpoint, data)) => {
                    let n = data.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&data[..n]);
                    Poll::Ready((endpoint, n))
                }
                None => {
                    self.wakers.register(cx.waker());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

#[derive(Default)]
struct ClockCell {
    counter: Cell<u32>,
    overflow: Cell<bool>,
}

impl drv_timer::Rtc for ClockCell {
    fn counter(&self) -> u32 {
        self.counter.get()
    }

    fn take_overflow(&self) -> bool {
        self.overflow.replace(false)
    }

    fn set_compare(&self, _ticks: u32) {}
}

struct Harness {
    exec: Executor,
    transport: Rc<TestTransport>,
    clock: Rc<ClockCell>,
    timer: Rc<Timer<Rc<ClockCell>>>,
    broker: Rc<Broker<Rc<TestTransport>, Rc<ClockCell>>>,
}

impl Harness {
    fn new() -> Self {
        let exec = Executor::new();
        let transport = Rc::new(TestTransport::default());
        let clock = Rc::new(ClockCell::default());
        let timer = Rc::new(Timer::new(clock.clone()));
        let broker =
            Rc::new(Broker::new(transport.clone(), timer.clone()));
        exec.spawn(broker.clone().receive_loop());
        exec.spawn(broker.clone().publish_loop());
        exec.spawn(broker.clone().send_pump());
        exec.spawn(broker.clone().resend_loop());
        exec.run_until_idle();
        Self {
            exec,
            transport,
            clock,
            timer,
            broker,
        }
    }

    fn run(&self) {
        self.exec.run_until_idle();
    }

    fn advance_ms(&self, ms: u32) {
        // 16384 Hz counter ticks
        let ticks = (ms << 11) / 125;
        self.clock.counter.set(self.clock.counter.get() + ticks);
        self.timer.poll();
        self.run();
    }

    fn deliver(&self, source: Endpoint, data: &[u8]) {
        self.transport.deliver(source, data);
        self.run();
    }

    /// Outbound PDUs as (endpoint, type, body-after-type).
    fn sent(&self) -> StdVec<(Endpoint, MsgType, StdVec<u8>)> {
        self.transport
            .took()
            .into_iter()
            .filter_map(|(endpoint, datagram)| {
                let mut r = Reader::new(&datagram)?;
                let t = r.msg_type()?;
                Some((endpoint, t, r.rest().to_vec()))
            })
            .collect()
    }

    /// Connects the gateway session: runs `connect` against a scripted
    /// CONNACK and returns once the session is up.
    fn connect_gateway(&self) {
        let broker = self.broker.clone();
        self.exec.spawn(async move {
            broker
                .connect(ep(GW), "node", true, None)
                .await
                .expect("connect");
        });
        self.run();
        let sent = self.sent();
        assert!(sent
            .iter()
            .any(|(e, t, _)| *e == ep(GW) && *t == MsgType::Connect));
        self.deliver(ep(GW), &[3, 0x05, 0x00]); // CONNACK accepted
        assert!(self.broker.is_gateway_connected());
    }

    /// Registers `topic` at the gateway with a scripted REGACK assigning
    /// `gateway_id`.
    fn register_gateway_topic(&self, topic: &'static str, gateway_id: u16) {
        let broker = self.broker.clone();
        self.exec.spawn(async move {
            broker
                .register_with_gateway(topic)
                .await
                .expect("register");
        });
        self.run();
        let sent = self.sent();
        let (_, _, body) = sent
            .iter()
            .find(|(_, t, _)| *t == MsgType::Register)
            .expect("REGISTER sent");
        let msg_id = (body[2] as u16) << 8 | body[3] as u16;
        let mut regack = vec![7, 0x0b];
        regack.extend_from_slice(&gateway_id.to_be_bytes());
        regack.extend_from_slice(&msg_id.to_be_bytes());
        regack.push(0); // accepted
        self.deliver(ep(GW), &regack);
    }

    fn connect_client(&self, port: u16, name: &str) {
        let mut connect = vec![0u8, 0x04, 0x00, 0x01, 0, 60];
        connect.extend_from_slice(name.as_bytes());
        connect[0] = connect.len() as u8;
        self.deliver(ep(port), &connect);
        let sent = self.sent();
        assert!(sent.iter().any(|(e, t, body)| *e == ep(port)
            && *t == MsgType::Connack
            && body == &[0]));
    }

    fn subscribe_client(&self, port: u16, topic: &str, qos: i8) -> u16 {
        let mut subscribe = vec![0u8, 0x12, mqttsn::make_qos(qos), 0, 42];
        subscribe.extend_from_slice(topic.as_bytes());
        subscribe[0] = subscribe.len() as u8;
        self.deliver(ep(port), &subscribe);
        let sent = self.sent();
        let (_, _, body) = sent
            .iter()
            .find(|(e, t, _)| *e == ep(port) && *t == MsgType::Suback)
            .expect("SUBACK sent");
        assert_eq!(*body.last().unwrap(), 0, "subscribe accepted");
        (body[1] as u16) << 8 | body[2] as u16
    }
}

#[test]
fn gateway_connect_and_keep_alive_state() {
    let h = Harness::new();
    h.connect_gateway();
}

#[test]
fn connect_retries_then_times_out() {
    let h = Harness::new();
    let result = Rc::new(Cell::new(None));
    let broker = h.broker.clone();
    let r = result.clone();
    h.exec.spawn(async move {
        r.set(Some(broker.connect(ep(GW), "node", true, None).await));
    });
    h.run();
    // no CONNACK arrives; each retry waits RECONNECT_TIME
    for _ in 0..3 {
        assert!(!h.sent().is_empty());
        h.advance_ms(5001);
    }
    assert_eq!(result.get(), Some(Err(Error::Timeout)));
    assert!(!h.broker.is_gateway_connected());
}

#[test]
fn publish_qos1_retries_with_dup_then_succeeds() {
    let h = Harness::new();
    h.connect_gateway();
    h.register_gateway_topic("room/light", 5);

    let publisher = h.broker.add_publisher("room/light").unwrap();
    publisher.publish(Message::OnOff(1));
    h.run();

    // first PUBLISH: gateway topic id, qos 1, no DUP
    let sent = h.sent();
    let (_, _, body) = sent
        .iter()
        .find(|(_, t, _)| *t == MsgType::Publish)
        .expect("PUBLISH sent");
    let flags = Flags(body[0]);
    assert_eq!(flags.qos(), 1);
    assert!(!flags.dup());
    assert_eq!((body[1] as u16) << 8 | body[2] as u16, 5);
    let msg_id = (body[3] as u16) << 8 | body[4] as u16;
    assert_ne!(msg_id, 0);
    assert_eq!(&body[5..], b"1");

    // the first PUBACK is dropped; after the retransmission time the
    // broker resends with DUP set and the same message id
    h.advance_ms(1001);
    let sent = h.sent();
    let (_, _, body) = sent
        .iter()
        .find(|(_, t, _)| *t == MsgType::Publish)
        .expect("retransmission");
    let flags = Flags(body[0]);
    assert!(flags.dup());
    assert_eq!((body[3] as u16) << 8 | body[4] as u16, msg_id);

    // second PUBACK completes the exchange; nothing more goes out
    let mut puback = vec![7, 0x0d, 0, 5];
    puback.extend_from_slice(&msg_id.to_be_bytes());
    puback.push(0);
    h.deliver(ep(GW), &puback);
    h.advance_ms(1001);
    assert!(!h
        .sent()
        .iter()
        .any(|(_, t, _)| *t == MsgType::Publish));
}

#[test]
fn client_connect_subscribe_and_receive_publish() {
    let h = Harness::new();
    h.connect_client(CLIENT_A, "lamp");
    let topic_id = h.subscribe_client(CLIENT_A, "room/light", 0);

    let publisher = h.broker.add_publisher("room/light").unwrap();
    publisher.publish(Message::OnOff(2));
    h.run();

    let sent = h.sent();
    let (_, _, body) = sent
        .iter()
        .find(|(e, t, _)| *e == ep(CLIENT_A) && *t == MsgType::Publish)
        .expect("client got the publish");
    assert_eq!((body[1] as u16) << 8 | body[2] as u16, topic_id);
    assert_eq!(&body[5..], b"!"); // toggle in wire text
}

#[test]
fn too_many_clients_are_rejected() {
    let h = Harness::new();
    for i in 0..MAX_CLIENT_COUNT {
        h.connect_client(51000 + i as u16, "c");
    }
    // one more: congested
    let mut connect = vec![0u8, 0x04, 0x00, 0x01, 0, 60, b'x'];
    connect[0] = connect.len() as u8;
    h.deliver(ep(59999), &connect);
    let sent = h.sent();
    assert!(sent.iter().any(|(e, t, body)| *e == ep(59999)
        && *t == MsgType::Connack
        && body == &[ReturnCode::RejectedCongested as u8]));
}

#[test]
fn client_publish_reaches_local_subscriber_and_other_client() {
    let h = Harness::new();
    h.connect_client(CLIENT_A, "switch");
    h.connect_client(CLIENT_B, "lamp");

    // local subscriber on the same topic
    let barrier = Rc::new(PlugBarrier::new());
    h.broker
        .add_subscriber(
            "room/light",
            0,
            SubscriberTarget {
                plug_index: 0,
                message_type: MessageType::OnOff,
                barrier: barrier.clone(),
            },
        )
        .unwrap();
    let got = Rc::new(Cell::new(None));
    let (b, g) = (barrier.clone(), got.clone());
    h.exec.spawn(async move {
        let (_, msg) = b.wait().await;
        g.set(Some(msg));
    });
    h.run();

    // client B subscribes over the wire
    let topic_id = h.subscribe_client(CLIENT_B, "room/light", 0);

    // client A registers the topic and publishes "on"
    let mut register = vec![0u8, 0x0a, 0, 0, 0, 9];
    register.extend_from_slice(b"room/light");
    register[0] = register.len() as u8;
    h.deliver(ep(CLIENT_A), &register);
    let sent = h.sent();
    let (_, _, body) = sent
        .iter()
        .find(|(_, t, _)| *t == MsgType::Regack)
        .expect("REGACK");
    let assigned = (body[0] as u16) << 8 | body[1] as u16;
    assert_eq!(assigned, topic_id);

    let mut publish = vec![0u8, 0x0c, 0x00];
    publish.extend_from_slice(&assigned.to_be_bytes());
    publish.extend_from_slice(&[0, 0]); // msg id (qos 0)
    publish.extend_from_slice(b"on");
    publish[0] = publish.len() as u8;
    h.deliver(ep(CLIENT_A), &publish);

    // the local subscriber got the converted message
    assert_eq!(got.get(), Some(Message::OnOff(1)));

    // client B got a forwarded PUBLISH, client A did not
    let sent = h.sent();
    assert!(sent.iter().any(|(e, t, body)| *e == ep(CLIENT_B)
        && *t == MsgType::Publish
        && body.ends_with(b"on")));
    assert!(!sent
        .iter()
        .any(|(e, t, _)| *e == ep(CLIENT_A) && *t == MsgType::Publish));
}

#[test]
fn retained_message_is_delivered_on_subscribe() {
    let h = Harness::new();
    h.connect_client(CLIENT_A, "sensor");

    // A registers and publishes with RETAIN
    let mut register = vec![0u8, 0x0a, 0, 0, 0, 9];
    register.extend_from_slice(b"room/temp");
    register[0] = register.len() as u8;
    h.deliver(ep(CLIENT_A), &register);
    let sent = h.sent();
    let (_, _, body) = sent
        .iter()
        .find(|(_, t, _)| *t == MsgType::Regack)
        .unwrap();
    let topic_id = (body[0] as u16) << 8 | body[1] as u16;

    let mut publish = vec![0u8, 0x0c, Flags::RETAIN];
    publish.extend_from_slice(&topic_id.to_be_bytes());
    publish.extend_from_slice(&[0, 0]);
    publish.extend_from_slice(b"21.5");
    publish[0] = publish.len() as u8;
    h.deliver(ep(CLIENT_A), &publish);
    h.sent();

    // a late subscriber gets the retained payload right after SUBACK
    h.connect_client(CLIENT_B, "display");
    let mut subscribe = vec![0u8, 0x12, 0x00, 0, 42];
    subscribe.extend_from_slice(b"room/temp");
    subscribe[0] = subscribe.len() as u8;
    h.deliver(ep(CLIENT_B), &subscribe);

    let sent = h.sent();
    let mut to_b = sent
        .iter()
        .filter(|(e, _, _)| *e == ep(CLIENT_B));
    assert_eq!(to_b.next().map(|(_, t, _)| *t), Some(MsgType::Suback));
    let (_, t, body) = to_b.next().expect("retained follows SUBACK");
    assert_eq!(*t, MsgType::Publish);
    assert!(Flags(body[0]).contains(Flags::RETAIN));
    assert!(body.ends_with(b"21.5"));
}

#[test]
fn empty_retained_payload_erases() {
    let h = Harness::new();
    h.connect_client(CLIENT_A, "sensor");
    let topic_id = h.subscribe_client(CLIENT_A, "t", 0);

    let mut publish = vec![0u8, 0x0c, Flags::RETAIN];
    publish.extend_from_slice(&topic_id.to_be_bytes());
    publish.extend_from_slice(&[0, 0]);
    publish.extend_from_slice(b"1");
    publish[0] = publish.len() as u8;
    h.deliver(ep(CLIENT_A), &publish);
    h.sent();

    // zero-length retained payload erases the stored message
    let mut erase = vec![0u8, 0x0c, Flags::RETAIN];
    erase.extend_from_slice(&topic_id.to_be_bytes());
    erase.extend_from_slice(&[0, 0]);
    erase[0] = erase.len() as u8;
    h.deliver(ep(CLIENT_A), &erase);
    h.sent();

    // a new subscriber gets no retained publish
    h.connect_client(CLIENT_B, "b");
    h.subscribe_client(CLIENT_B, "t", 0);
    assert!(!h
        .sent()
        .iter()
        .any(|(e, t, _)| *e == ep(CLIENT_B) && *t == MsgType::Publish));
}

#[test]
fn will_exchange_and_publication() {
    let h = Harness::new();

    // local subscriber on the will topic
    let barrier = Rc::new(PlugBarrier::new());
    h.broker
        .add_subscriber(
            "node/online",
            0,
            SubscriberTarget {
                plug_index: 0,
                message_type: MessageType::OnOff,
                barrier: barrier.clone(),
            },
        )
        .unwrap();
    let got = Rc::new(Cell::new(None));
    let (b, g) = (barrier.clone(), got.clone());
    h.exec.spawn(async move {
        let (_, msg) = b.wait().await;
        g.set(Some(msg));
    });
    h.run();

    // CONNECT with the will flag runs the will exchange before CONNACK
    let mut connect =
        vec![0u8, 0x04, Flags::WILL, 0x01, 0, 60, b'd', b'e', b'v'];
    connect[0] = connect.len() as u8;
    h.deliver(ep(CLIENT_A), &connect);
    let sent = h.sent();
    assert!(sent
        .iter()
        .any(|(_, t, _)| *t == MsgType::WillTopicReq));

    let mut will_topic = vec![0u8, 0x07, 0x00];
    will_topic.extend_from_slice(b"node/online");
    will_topic[0] = will_topic.len() as u8;
    h.deliver(ep(CLIENT_A), &will_topic);
    let sent = h.sent();
    assert!(sent.iter().any(|(_, t, _)| *t == MsgType::WillMsgReq));

    let mut will_msg = vec![0u8, 0x09];
    will_msg.extend_from_slice(b"0");
    will_msg[0] = will_msg.len() as u8;
    h.deliver(ep(CLIENT_A), &will_msg);
    let sent = h.sent();
    assert!(sent.iter().any(|(e, t, body)| *e == ep(CLIENT_A)
        && *t == MsgType::Connack
        && body == &[0]));

    // dropping the connection publishes the will
    h.broker.drop_connection(1);
    h.run();
    assert_eq!(got.get(), Some(Message::OnOff(0)));
}

#[test]
fn local_subscriber_gets_retained_at_bind() {
    let h = Harness::new();
    h.connect_client(CLIENT_A, "sensor");
    let topic_id = h.subscribe_client(CLIENT_A, "room/level", 0);

    let mut publish = vec![0u8, 0x0c, Flags::RETAIN];
    publish.extend_from_slice(&topic_id.to_be_bytes());
    publish.extend_from_slice(&[0, 0]);
    publish.extend_from_slice(b"0.5");
    publish[0] = publish.len() as u8;
    h.deliver(ep(CLIENT_A), &publish);

    let barrier = Rc::new(PlugBarrier::new());
    let got = Rc::new(Cell::new(None));
    let (b, g) = (barrier.clone(), got.clone());
    h.exec.spawn(async move {
        let (_, msg) = b.wait().await;
        g.set(Some(msg));
    });
    h.run();

    h.broker
        .add_subscriber(
            "room/level",
            0,
            SubscriberTarget {
                plug_index: 2,
                message_type: MessageType::Level,
                barrier,
            },
        )
        .unwrap();
    h.run();
    match got.get() {
        Some(Message::Level(v)) => {
            assert!((v.value() - 0.5).abs() < 1e-3)
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn unknown_peer_gets_disconnect() {
    let h = Harness::new();
    h.deliver(ep(60000), &[2, 0x16]); // PINGREQ from a stranger
    let sent = h.sent();
    assert!(sent
        .iter()
        .any(|(e, t, _)| *e == ep(60000) && *t == MsgType::Disconnect));
}
