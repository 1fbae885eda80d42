//! Shared fixtures for the integration tests: a recording router, packet
//! builders and a handful of test handlers.

#![allow(dead_code)]

use pupstream::prelude::*;
use pupstream::BspAck;
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

pub const LOCAL: HostAddress = HostAddress {
    network: 1,
    host: 0o44,
};
pub const SERVICE_SOCKET: u32 = 0o20;
pub const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Sends pupstream's tracing output to the test writer when `TEST_LOG` is
/// set: 1, 2 or 3 for info, debug or trace, or any level name such as
/// `warn`. Worker thread names (`bsp-worker-<socket>`) are included.
pub fn init_tracing() {
    INIT.call_once(|| {
        let Ok(setting) = std::env::var("TEST_LOG") else {
            return;
        };
        let level = match setting.trim() {
            "" | "0" => return,
            "1" => "info",
            "2" => "debug",
            "3" => "trace",
            named => named,
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(format!("pupstream={level}")))
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Recording Router
// ============================================================================

/// Router that keeps every packet it is asked to send.
pub struct MockRouter {
    local: HostAddress,
    sent: Mutex<Vec<Pup>>,
    cond: Condvar,
}

impl MockRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: LOCAL,
            sent: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        })
    }

    pub fn sent(&self) -> Vec<Pup> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, pup_type: PupType) -> Vec<Pup> {
        self.sent()
            .into_iter()
            .filter(|pup| pup.pup_type == pup_type)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Waits until a packet matching `pred` has been sent.
    pub fn wait_for(&self, pred: impl Fn(&Pup) -> bool) -> Option<Pup> {
        let deadline = Instant::now() + WAIT;
        let mut sent = self.sent.lock().unwrap();
        loop {
            if let Some(pup) = sent.iter().find(|pup| pred(pup)) {
                return Some(pup.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sent = self.cond.wait_timeout(sent, deadline - now).unwrap().0;
        }
    }
}

impl PupRouter for MockRouter {
    fn send_pup(&self, pup: Pup) {
        self.sent.lock().unwrap().push(pup);
        self.cond.notify_all();
    }

    fn local_address(&self) -> HostAddress {
        self.local
    }
}

// ============================================================================
// Setup Helpers
// ============================================================================

/// Defaults with short timeouts so failure paths finish quickly.
pub fn test_config() -> BspConfig {
    BspConfig {
        max_workers: 8,
        worker_grace: Duration::from_millis(200),
        ack_timeout: Duration::from_millis(100),
        ..BspConfig::default()
    }
}

pub fn dispatcher_with(config: BspConfig) -> (Dispatcher, Arc<MockRouter>) {
    init_tracing();
    let router = MockRouter::new();
    let dispatcher = Dispatcher::new(config, router.clone());
    (dispatcher, router)
}

pub fn dispatcher() -> (Dispatcher, Arc<MockRouter>) {
    dispatcher_with(test_config())
}

/// Establishes one channel and clears the router log.
pub fn open_channel(
    dispatcher: &Dispatcher,
    router: &MockRouter,
    client: PupPort,
    id: u32,
    kind: HandlerKind,
) -> Arc<Channel> {
    let socket = dispatcher
        .establish(&rfc(client, id), kind)
        .expect("rendezvous should succeed");
    router.clear();
    dispatcher.channel(socket).expect("channel registered")
}

/// Polls `cond` until it holds or the wait limit passes.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// Packet Builders
// ============================================================================

pub fn client_port(n: u32) -> PupPort {
    PupPort::new(1, 0o77, 0x5000 + n)
}

/// The port clients address rendezvous requests to. The network is left
/// zero ("this network").
pub fn service_port() -> PupPort {
    PupPort::new(0, LOCAL.host, SERVICE_SOCKET)
}

pub fn rfc(client: PupPort, id: u32) -> Pup {
    Pup::new(
        PupType::Rfc,
        id,
        service_port(),
        client,
        client.to_bytes().to_vec(),
    )
}

/// A packet from the channel's client to its server port.
pub fn to_channel(channel: &Channel, pup_type: PupType, id: u32, contents: &[u8]) -> Pup {
    Pup::new(
        pup_type,
        id,
        channel.server_port(),
        channel.client_port(),
        contents.to_vec(),
    )
}

pub fn ack_to(channel: &Channel, id: u32, max_bytes: u16, max_pups: u16) -> Pup {
    let ack = BspAck::new(max_bytes, max_pups, 0);
    to_channel(channel, PupType::Ack, id, &ack.to_bytes())
}

/// Reads exactly `len` data bytes, failing on a mark.
pub fn read_data(channel: &Channel, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    while out.len() < len {
        match channel.read(&mut buf).expect("read") {
            ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadOutcome::Mark(mark) => panic!("unexpected mark {mark}"),
        }
    }
    out
}

// ============================================================================
// Test Handlers
// ============================================================================

/// Leaves the stream alone so the test thread can read it directly. Exits
/// when cancelled or once the channel is gone.
pub const PARKED: HandlerKind = HandlerKind::new("parked", parked);

/// Reads and discards until end of stream.
pub const DRAIN: HandlerKind = HandlerKind::new("drain", drain);

/// Returns at once without error.
pub const FINISH: HandlerKind = HandlerKind::new("finish", finish);

/// Fails with a handler error.
pub const FAILING: HandlerKind = HandlerKind::new("failing", failing);

/// Panics.
pub const PANICKING: HandlerKind = HandlerKind::new("panicking", panicking);

/// Ignores cancellation and sleeps well past any grace period.
pub const STUCK: HandlerKind = HandlerKind::new("stuck", stuck);

struct Parked;

impl Handler for Parked {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), Error> {
        while !ctx.is_cancelled() && !ctx.channel().state().is_terminal() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

fn parked(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Parked)
}

struct Drain;

impl Handler for Drain {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), Error> {
        let mut buf = [0u8; 128];
        loop {
            ctx.channel().read(&mut buf)?;
        }
    }
}

fn drain(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Drain)
}

struct Finish;

impl Handler for Finish {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<(), Error> {
        Ok(())
    }
}

fn finish(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Finish)
}

struct Failing;

impl Handler for Failing {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<(), Error> {
        Err(Error::Handler("boom".to_string()))
    }
}

fn failing(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Failing)
}

struct Panicking;

impl Handler for Panicking {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<(), Error> {
        panic!("handler exploded");
    }
}

fn panicking(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Panicking)
}

struct Stuck;

impl Handler for Stuck {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<(), Error> {
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }
}

fn stuck(_channel: Arc<Channel>) -> Box<dyn Handler> {
    Box::new(Stuck)
}
