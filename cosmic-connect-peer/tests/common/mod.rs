//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cosmic_connect_peer::{
    DeviceHandle, DeviceType, Link, LocalIdentity, Packet, PacketReceiver, PairingCallback,
    PairingFailure, PayloadProgress, PeerConfig, PeerIdentity, Plugin, PluginFactory, PluginInfo,
    ProtocolError, Result, SendPacketStatusCallback,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};

/// Route library logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

pub fn fast_config() -> PeerConfig {
    PeerConfig {
        pairing_timeout_secs: 1,
        payload_confirmation_timeout_secs: 1,
        ..PeerConfig::default()
    }
}

/// Identity of a phone announcing ping and battery support
pub fn phone_identity(device_id: &str) -> PeerIdentity {
    let packet = LocalIdentity::with_id(device_id, "Pixel 8", DeviceType::Phone)
        .with_capabilities(
            vec!["kdeconnect.ping".to_string(), "kdeconnect.battery.request".to_string()],
            vec!["kdeconnect.ping".to_string(), "kdeconnect.battery".to_string()],
        )
        .to_identity_packet();
    PeerIdentity::from_identity_packet(&packet, b"phone certificate".to_vec())
        .expect("valid identity packet")
}

/// In-memory link; `up` decides whether sends are accepted
#[derive(Debug)]
pub struct ScriptedLink {
    name: String,
    up: AtomicBool,
    gate: Option<Semaphore>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<Packet>>,
    receivers: Mutex<Vec<Weak<dyn PacketReceiver>>>,
}

impl ScriptedLink {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    /// Link whose sends block until [`ScriptedLink::release`]
    pub fn gated(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    fn build(name: &str, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            up: AtomicBool::new(true),
            gate: gated.then(|| Semaphore::new(0)),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent().into_iter().map(|p| p.packet_type).collect()
    }

    pub fn as_link(self: &Arc<Self>) -> Arc<dyn Link> {
        Arc::clone(self) as Arc<dyn Link>
    }

    /// Feed a packet to the device as if read from the wire
    pub async fn receive(&self, packet: Packet) {
        let receivers: Vec<_> = self
            .receivers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for receiver in receivers {
            receiver.on_packet_received(packet.clone()).await;
        }
    }
}

#[async_trait]
impl Link for ScriptedLink {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn send_packet(
        &self,
        packet: &Packet,
        progress: &dyn PayloadProgress,
        _send_payload_same_thread: bool,
    ) -> Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))?
                .forget();
        }
        if !self.up.load(Ordering::SeqCst) {
            return Err(ProtocolError::from_io_error(
                io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is down", self.name)),
                "sending packet",
            ));
        }
        if packet.has_payload() {
            progress.on_payload_progress_changed(50);
            progress.on_payload_progress_changed(100);
        }
        self.sent.lock().unwrap().push(packet.clone());
        Ok(true)
    }

    fn add_packet_receiver(&self, receiver: Weak<dyn PacketReceiver>) {
        self.receivers.lock().unwrap().push(receiver);
    }

    fn remove_packet_receiver(&self, receiver: &Weak<dyn PacketReceiver>) {
        self.receivers
            .lock()
            .unwrap()
            .retain(|r| !Weak::ptr_eq(r, receiver));
    }
}

/// Send callback counting outcomes
#[derive(Debug, Default)]
pub struct Outcome {
    pub successes: AtomicUsize,
    pub failures: Mutex<Vec<String>>,
}

impl Outcome {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    pub fn settled(&self) -> usize {
        self.successes() + self.failures().len()
    }
}

impl SendPacketStatusCallback for Outcome {
    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: &ProtocolError) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

/// Pairing observer recording events as strings
#[derive(Debug, Default)]
pub struct PairingLog(Mutex<Vec<String>>);

impl PairingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }
}

impl PairingCallback for PairingLog {
    fn incoming_pair_request(&self) {
        self.push("incoming");
    }

    fn pairing_successful(&self) {
        self.push("paired");
    }

    fn pairing_failed(&self, reason: &PairingFailure) {
        self.push(format!("failed: {}", reason));
    }

    fn unpaired(&self) {
        self.push("unpaired");
    }
}

/// What plugins of a [`RecordingFactory`] saw
#[derive(Debug, Default)]
pub struct PluginLog {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub packets: Mutex<Vec<String>>,
    pub unpaired_packets: Mutex<Vec<String>>,
}

impl PluginLog {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn packets(&self) -> Vec<String> {
        self.packets.lock().unwrap().clone()
    }

    pub fn unpaired_packets(&self) -> Vec<String> {
        self.unpaired_packets.lock().unwrap().clone()
    }
}

/// Factory of plugins that log packets; `panics` makes them crash instead
pub struct RecordingFactory {
    info: PluginInfo,
    panics: bool,
    pub log: Arc<PluginLog>,
}

impl RecordingFactory {
    pub fn new(info: PluginInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            panics: false,
            log: Arc::new(PluginLog::default()),
        })
    }

    pub fn panicking(info: PluginInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            panics: true,
            log: Arc::new(PluginLog::default()),
        })
    }
}

impl PluginFactory for RecordingFactory {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn create(&self, _device: DeviceHandle) -> Result<Arc<dyn Plugin>> {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingPlugin {
            panics: self.panics,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingPlugin {
    panics: bool,
    log: Arc<PluginLog>,
}

#[async_trait]
impl Plugin for RecordingPlugin {
    async fn on_destroy(&self) {
        self.log.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_packet_received(&self, packet: &Packet) -> Result<()> {
        if self.panics {
            panic!("plugin crashed on {}", packet.packet_type);
        }
        self.log.packets.lock().unwrap().push(packet.packet_type.clone());
        Ok(())
    }

    async fn on_unpaired_device_packet_received(&self, packet: &Packet) -> Result<()> {
        self.log
            .unpaired_packets
            .lock()
            .unwrap()
            .push(packet.packet_type.clone());
        Ok(())
    }
}
