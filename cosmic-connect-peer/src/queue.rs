//! Outgoing Packet Queue
//!
//! One queue exists per device while it has at least one link. A worker task
//! drains entries in submission order and sends each over the device's links
//! with failover (see [`crate::link::send_over_links`]).
//!
//! Entries carrying a replace id coalesce: enqueueing a packet whose replace
//! id matches an unsent entry overwrites that entry in place, and the
//! overwritten entry's callback is dropped without being called.

use crate::link::{send_over_links, LinkSet, SendPacketStatusCallback};
use crate::{Packet, ProtocolError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

struct QueueItem {
    packet: Packet,
    replace_id: Option<u32>,
    callback: Arc<dyn SendPacketStatusCallback>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    exit: bool,
}

struct QueueInner {
    device_id: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Per-device outgoing packet queue
pub struct DevicePacketQueue {
    inner: Arc<QueueInner>,
}

impl DevicePacketQueue {
    /// Create the queue and spawn its worker on the current tokio runtime
    pub fn new(device_id: impl Into<String>, links: Arc<LinkSet>) -> Self {
        let inner = Arc::new(QueueInner {
            device_id: device_id.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });

        tokio::spawn(Self::run(Arc::clone(&inner), links));
        debug!("Started packet queue for {}", inner.device_id);

        Self { inner }
    }

    async fn run(inner: Arc<QueueInner>, links: Arc<LinkSet>) {
        loop {
            let next = {
                let mut state = inner.lock();
                if state.exit {
                    break;
                }
                state.items.pop_front()
            };

            match next {
                Some(item) => {
                    let links = links.snapshot();
                    send_over_links(&links, &item.packet, item.callback.as_ref(), false).await;
                }
                None => inner.notify.notified().await,
            }
        }

        debug!("Packet queue for {} stopped", inner.device_id);
    }

    /// Queue a packet for sending
    ///
    /// A `replace_id` of `Some(n)` with `n > 0` supersedes any unsent entry
    /// with the same id, keeping that entry's position. Never blocks. After
    /// the queue has been shut down the callback fails with
    /// [`ProtocolError::NotConnected`].
    pub fn add_packet(
        &self,
        packet: Packet,
        replace_id: Option<u32>,
        callback: Arc<dyn SendPacketStatusCallback>,
    ) {
        let replace_id = replace_id.filter(|id| *id > 0);
        let mut state = self.inner.lock();

        if state.exit {
            drop(state);
            callback.on_failure(&ProtocolError::NotConnected);
            return;
        }

        if let Some(id) = replace_id {
            if let Some(existing) = state
                .items
                .iter_mut()
                .find(|item| item.replace_id == Some(id))
            {
                debug!(
                    "Replacing queued {} packet for {} (replace id {})",
                    existing.packet.packet_type, self.inner.device_id, id
                );
                existing.packet = packet;
                existing.callback = callback;
                return;
            }
        }

        state.items.push_back(QueueItem {
            packet,
            replace_id,
            callback,
        });
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Remove and return the unsent packet queued under `replace_id`
    ///
    /// The entry's callback is dropped without being called.
    pub fn take_if_pending(&self, replace_id: u32) -> Option<Packet> {
        if replace_id == 0 {
            return None;
        }

        let mut state = self.inner.lock();
        let index = state
            .items
            .iter()
            .position(|item| item.replace_id == Some(replace_id))?;
        state.items.remove(index).map(|item| item.packet)
    }

    /// Number of entries not yet handed to a link
    pub fn pending(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Stop the worker and fail every unsent entry with `NotConnected`
    ///
    /// An entry already handed to a link completes normally.
    pub fn disconnected(&self) {
        let drained: Vec<QueueItem> = {
            let mut state = self.inner.lock();
            if state.exit {
                return;
            }
            state.exit = true;
            state.items.drain(..).collect()
        };
        self.inner.notify.notify_one();

        if !drained.is_empty() {
            info!(
                "Failing {} pending packets for disconnected device {}",
                drained.len(),
                self.inner.device_id
            );
        }
        for item in drained {
            item.callback.on_failure(&ProtocolError::NotConnected);
        }
    }
}

impl Drop for DevicePacketQueue {
    fn drop(&mut self) {
        self.disconnected();
    }
}

impl std::fmt::Debug for DevicePacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePacketQueue")
            .field("device_id", &self.inner.device_id)
            .field("pending", &self.pending())
            .finish()
    }
}
