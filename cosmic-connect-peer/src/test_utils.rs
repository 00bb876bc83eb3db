//! Test doubles shared by the unit tests

use crate::device::DeviceHandle;
use crate::link::{Link, PacketReceiver, PayloadProgress, SendPacketStatusCallback};
use crate::plugins::{Plugin, PluginFactory, PluginInfo};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    Succeed,
    Refuse,
    Fail,
}

/// In-memory link recording what it sends
#[derive(Debug)]
pub struct MockLink {
    name: String,
    behavior: Mutex<LinkBehavior>,
    gate: Option<Semaphore>,
    progress: Mutex<Vec<u8>>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<Packet>>,
    receivers: Mutex<Vec<Weak<dyn PacketReceiver>>>,
    disconnects: AtomicUsize,
}

impl MockLink {
    fn build(name: &str, behavior: LinkBehavior, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior: Mutex::new(behavior),
            gate: gated.then(|| Semaphore::new(0)),
            progress: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn succeeding(name: &str) -> Arc<Self> {
        Self::build(name, LinkBehavior::Succeed, false)
    }

    pub fn refusing(name: &str) -> Arc<Self> {
        Self::build(name, LinkBehavior::Refuse, false)
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Self::build(name, LinkBehavior::Fail, false)
    }

    /// Succeeding link whose sends wait for [`MockLink::release`]
    pub fn gated(name: &str) -> Arc<Self> {
        Self::build(name, LinkBehavior::Succeed, true)
    }

    /// Report these progress values for every send
    pub fn with_progress(self: Arc<Self>, values: Vec<u8>) -> Arc<Self> {
        *self.progress.lock().unwrap() = values;
        self
    }

    pub fn set_behavior(&self, behavior: LinkBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Let `sends` gated sends complete
    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_for_attempts(&self, attempts: usize) {
        wait_until("link send attempts", || self.attempts() >= attempts).await;
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate a packet read from the link
    pub async fn deliver(&self, packet: Packet) {
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
impl Link for MockLink {
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

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            LinkBehavior::Succeed => {
                let values = self.progress.lock().unwrap().clone();
                for value in values {
                    progress.on_payload_progress_changed(value);
                }
                self.sent.lock().unwrap().push(packet.clone());
                Ok(true)
            }
            LinkBehavior::Refuse => Ok(false),
            LinkBehavior::Fail => Err(ProtocolError::from_io_error(
                io::Error::new(io::ErrorKind::ConnectionReset, format!("{} reset", self.name)),
                "sending packet",
            )),
        }
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

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Send callback recording every notification
#[derive(Debug, Default)]
pub struct RecordingCallback {
    successes: AtomicUsize,
    failures: AtomicUsize,
    errors: Mutex<Vec<String>>,
    progress: Mutex<Vec<u8>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.errors.lock().unwrap().last().cloned()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub async fn wait_for_terminal(&self, count: usize) {
        wait_until("send callbacks", || self.successes() + self.failures() >= count).await;
    }
}

impl SendPacketStatusCallback for RecordingCallback {
    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: &ProtocolError) {
        self.errors.lock().unwrap().push(error.to_string());
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_payload_progress_changed(&self, percent: u8) {
        self.progress.lock().unwrap().push(percent);
    }
}

/// How plugins created by a [`TestPluginFactory`] behave
#[derive(Debug, Clone, Copy)]
pub struct PluginBehavior {
    pub compatible: bool,
    pub required_permissions: bool,
    pub optional_permissions: bool,
    pub fail_create: bool,
    pub fail_packets: bool,
    pub panic_packets: bool,
}

impl Default for PluginBehavior {
    fn default() -> Self {
        Self {
            compatible: true,
            required_permissions: true,
            optional_permissions: true,
            fail_create: false,
            fail_packets: false,
            panic_packets: false,
        }
    }
}

#[derive(Debug, Default)]
struct PluginRecord {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    received: Mutex<Vec<Packet>>,
    received_unpaired: Mutex<Vec<Packet>>,
}

/// Factory of recording plugins
pub struct TestPluginFactory {
    info: PluginInfo,
    behavior: PluginBehavior,
    record: Arc<PluginRecord>,
}

impl TestPluginFactory {
    pub fn new(info: PluginInfo) -> Arc<Self> {
        Self::with_behavior(info, PluginBehavior::default())
    }

    pub fn with_behavior(info: PluginInfo, behavior: PluginBehavior) -> Arc<Self> {
        Arc::new(Self {
            info,
            behavior,
            record: Arc::new(PluginRecord::default()),
        })
    }

    /// Number of instances created
    pub fn created(&self) -> usize {
        self.record.created.load(Ordering::SeqCst)
    }

    /// Number of `on_destroy` calls
    pub fn destroyed(&self) -> usize {
        self.record.destroyed.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Packet> {
        self.record.received.lock().unwrap().clone()
    }

    pub fn received_unpaired(&self) -> Vec<Packet> {
        self.record.received_unpaired.lock().unwrap().clone()
    }
}

impl PluginFactory for TestPluginFactory {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn create(&self, _device: DeviceHandle) -> Result<Arc<dyn Plugin>> {
        self.record.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestPlugin {
            key: self.info.key.clone(),
            behavior: self.behavior,
            record: Arc::clone(&self.record),
        }))
    }
}

struct TestPlugin {
    key: String,
    behavior: PluginBehavior,
    record: Arc<PluginRecord>,
}

#[async_trait]
impl Plugin for TestPlugin {
    async fn on_create(&self) -> Result<()> {
        if self.behavior.fail_create {
            return Err(ProtocolError::Plugin(format!("{} refused to start", self.key)));
        }
        Ok(())
    }

    async fn on_destroy(&self) {
        self.record.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_packet_received(&self, packet: &Packet) -> Result<()> {
        if self.behavior.panic_packets {
            panic!("{} crashed", self.key);
        }
        if self.behavior.fail_packets {
            return Err(ProtocolError::Plugin(format!("{} failed", self.key)));
        }
        self.record.received.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn on_unpaired_device_packet_received(&self, packet: &Packet) -> Result<()> {
        self.record
            .received_unpaired
            .lock()
            .unwrap()
            .push(packet.clone());
        Ok(())
    }

    fn is_compatible(&self) -> bool {
        self.behavior.compatible
    }

    fn check_required_permissions(&self) -> bool {
        self.behavior.required_permissions
    }

    fn check_optional_permissions(&self) -> bool {
        self.behavior.optional_permissions
    }
}
