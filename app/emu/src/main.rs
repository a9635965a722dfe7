// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side emulator.
//!
//! Runs the node core on a workstation: the cooperative executor and the
//! timer tick from wall-clock time, the MQTT-SN broker talks UDP (uplink to
//! a gateway plus downlink clients on the local socket), and the function
//! runtime executes a demo configuration from RAM-backed storage. The
//! hardware-facing drivers have no role here; everything above them is the
//! same code the firmware runs.

use anyhow::{Context, Result};
use clap::Parser;
use drv_timer::{Calendar, Rtc, Timer};
use exec::Executor;
use message::MessageType;
use plug::{PlugBarrier, Subscriber, SubscriberTarget};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};
use storage::RamStorage;
use task_broker::{Broker, Endpoint, Transport};
use task_functions::{
    FunctionConfig, Functions, LightConfig, LightSetting, SwitchConfig,
};

#[derive(Parser)]
#[clap(name = "emu", about = "home-automation node emulator")]
struct Args {
    /// MQTT-SN gateway to connect the uplink to.
    #[clap(long, default_value = "127.0.0.1:47193")]
    gateway: SocketAddr,

    /// Local UDP port for the uplink and downlink clients.
    #[clap(long, default_value_t = 47194)]
    port: u16,

    /// Client name announced to the gateway.
    #[clap(long, default_value = "roomnode")]
    name: String,
}

/// 16384 Hz 24-bit counter derived from host time.
struct StdRtc {
    start: Instant,
    epoch: Cell<u64>,
}

impl StdRtc {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            epoch: Cell::new(0),
        }
    }

    fn full_ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() * 16384
            + (elapsed.subsec_nanos() as u64 * 16384) / 1_000_000_000
    }
}

impl Rtc for StdRtc {
    fn counter(&self) -> u32 {
        (self.full_ticks() & 0xff_ffff) as u32
    }

    fn take_overflow(&self) -> bool {
        let epoch = self.full_ticks() >> 24;
        if epoch != self.epoch.get() {
            self.epoch.set(self.epoch.get() + 1);
            true
        } else {
            false
        }
    }

    fn set_compare(&self, _ticks: u32) {
        // the main loop polls the timer continuously
    }
}

struct UdpTransport {
    socket: UdpSocket,
    inbox: RefCell<VecDeque<(Endpoint, Vec<u8>)>>,
    wakers: exec::WakerSet,
}

impl UdpTransport {
    /// Drains the socket into the inbox; called from the main loop.
    fn pump(&self) {
        let mut buffer = [0u8; 512];
        let mut any = false;
        while let Ok((n, source)) = self.socket.recv_from(&mut buffer) {
            self.inbox
                .borrow_mut()
                .push_back((source, buffer[..n].to_vec()));
            any = true;
        }
        if any {
            self.wakers.wake_all();
        }
    }
}

impl Transport for UdpTransport {
    async fn send(&self, endpoint: Endpoint, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, endpoint) {
            eprintln!("send to {endpoint} failed: {e}");
        }
    }

    async fn receive(&self, buffer: &mut [u8]) -> (Endpoint, usize) {
        core::future::poll_fn(|cx| {
            let mut inbox = self.inbox.borrow_mut();
            match inbox.pop_front() {
                Some((endpoint, data)) => {
                    let n = data.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&data[..n]);
                    core::task::Poll::Ready((endpoint, n))
                }
                None => {
                    self.wakers.register(cx.waker());
                    core::task::Poll::Pending
                }
            }
        })
        .await
    }
}

/// Seeds the demo configuration on first boot.
fn seed_functions(
    functions: &Functions<RamStorage, Rc<StdRtc>>,
) -> Result<(u8, u8)> {
    let mut settings = heapless::Vec::new();
    settings
        .push(LightSetting {
            brightness: 100,
            fade: 10,
        })
        .ok();
    settings
        .push(LightSetting {
            brightness: 30,
            fade: 10,
        })
        .ok();
    let light = functions
        .set(
            None,
            "ceiling",
            FunctionConfig::Light(LightConfig {
                timeout: 0,
                off_fade: 20,
                timeout_fade: 50,
                settings,
            }),
        )
        .map_err(|e| anyhow::anyhow!("light: {e:?}"))?;
    let socket = functions
        .set(
            None,
            "socket",
            FunctionConfig::Switch(SwitchConfig { timeout: 0 }),
        )
        .map_err(|e| anyhow::anyhow!("switch: {e:?}"))?;
    Ok((light, socket))
}

/// Connects a broker topic to a function input plug.
fn wire_input(
    broker: &Rc<Broker<Rc<UdpTransport>, Rc<StdRtc>>>,
    functions: &Functions<RamStorage, Rc<StdRtc>>,
    topic: &str,
    id: u8,
    plug_index: u8,
) -> Result<()> {
    let target = functions
        .subscriber_target(id, plug_index)
        .context("no such input plug")?;
    broker
        .add_subscriber(topic, 0, target)
        .map_err(|e| anyhow::anyhow!("subscribe {topic}: {e:?}"))?;
    Ok(())
}

/// Bridges a function output plug onto a broker topic.
fn wire_output(
    exec: &Executor,
    broker: &Rc<Broker<Rc<UdpTransport>, Rc<StdRtc>>>,
    functions: &Functions<RamStorage, Rc<StdRtc>>,
    id: u8,
    plug_index: u8,
    message_type: MessageType,
    topic: &str,
) -> Result<()> {
    let publisher = broker
        .add_publisher(topic)
        .map_err(|e| anyhow::anyhow!("publish {topic}: {e:?}"))?;
    let barrier = Rc::new(PlugBarrier::new());
    functions.subscribe(
        id,
        Subscriber {
            source_plug: plug_index,
            source_index: 0,
            target: SubscriberTarget {
                plug_index,
                message_type,
                barrier: barrier.clone(),
            },
        },
    );
    exec.spawn(async move {
        loop {
            let (_, msg) = barrier.wait().await;
            publisher.publish(msg);
        }
    });
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let exec = Executor::new();
    let rtc = Rc::new(StdRtc::new());
    let timer = Rc::new(Timer::new(rtc.clone()));
    let calendar = Rc::new(Calendar::new());

    let socket = UdpSocket::bind(("0.0.0.0", args.port))
        .with_context(|| format!("binding UDP port {}", args.port))?;
    socket.set_nonblocking(true)?;
    let transport = Rc::new(UdpTransport {
        socket,
        inbox: RefCell::new(VecDeque::new()),
        wakers: exec::WakerSet::new(),
    });

    let broker = Rc::new(Broker::new(transport.clone(), timer.clone()));
    exec.spawn(broker.clone().receive_loop());
    exec.spawn(broker.clone().publish_loop());
    exec.spawn(broker.clone().send_pump());
    exec.spawn(broker.clone().resend_loop());

    let functions =
        Functions::new(exec.clone(), timer.clone(), RamStorage::new());
    functions.load();
    let (light, switch) = seed_functions(&functions)?;
    println!(
        "functions: light #{light} ({:?}), switch #{switch}",
        functions.name(light).unwrap()
    );

    wire_input(&broker, &functions, "room/light/set", light, 0)?;
    wire_output(
        &exec,
        &broker,
        &functions,
        light,
        1,
        MessageType::OnOff,
        "room/light/state",
    )?;
    wire_output(
        &exec,
        &broker,
        &functions,
        light,
        2,
        MessageType::MoveToLevel,
        "room/light/brightness",
    )?;
    wire_input(&broker, &functions, "room/socket/set", switch, 0)?;
    wire_output(
        &exec,
        &broker,
        &functions,
        switch,
        1,
        MessageType::OnOff,
        "room/socket/state",
    )?;

    // bring the uplink up, then register the topics there
    {
        let broker = broker.clone();
        let gateway = args.gateway;
        let name = args.name.clone();
        exec.spawn(async move {
            match broker.connect(gateway, &name, true, None).await {
                Ok(()) => {
                    println!("gateway {gateway} connected");
                    for topic in [
                        "room/light/state",
                        "room/light/brightness",
                        "room/socket/state",
                    ] {
                        if let Err(e) =
                            broker.register_with_gateway(topic).await
                        {
                            eprintln!("register {topic}: {e:?}");
                        }
                    }
                    for topic in ["room/light/set", "room/socket/set"] {
                        if let Err(e) =
                            broker.subscribe_with_gateway(topic).await
                        {
                            eprintln!("subscribe {topic}: {e:?}");
                        }
                    }
                    broker.ping_loop().await;
                    println!("gateway link lost");
                }
                Err(e) => eprintln!("gateway connect failed: {e:?}"),
            }
        });
    }

    println!(
        "listening on udp port {}, uplink {}",
        args.port, args.gateway
    );

    // the event loop: run tasks, pump I/O, tick the clocks
    let mut last_second = Instant::now();
    loop {
        exec.run_until_idle();
        transport.pump();
        timer.poll();
        if last_second.elapsed() >= Duration::from_secs(1) {
            last_second += Duration::from_secs(1);
            calendar.tick();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
