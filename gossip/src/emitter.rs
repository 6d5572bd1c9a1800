// Copyright (c) 2018-2022 The Botho Foundation

//! The Batching Emitter (L3): coalesces outbound gossip into bursts of
//! bounded size/latency, replaying each message a fixed number of times
//! (spec.md §4.3).

use crate::types::{NetworkMember, Publisher};
use rksync_common::PkiId;
use rksync_transport::proto::Envelope;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::trace;

/// A message queued for propagation: the signed envelope, a filter over the
/// current membership, and how many more bursts it survives (spec.md §3).
#[derive(Clone)]
pub struct EmittedMessage {
    /// The signed wire envelope.
    pub envelope: Envelope,
    /// Only peers this predicate accepts receive the message.
    pub filter: Arc<dyn Fn(&NetworkMember) -> bool + Send + Sync>,
    /// Bursts remaining before eviction.
    pub remaining_iterations: u32,
    /// The owning channel's chainMac, if this is channel-restricted.
    pub channel: Option<Vec<u8>>,
}

impl EmittedMessage {
    /// Build a discovery-scoped message: filter accepts every peer.
    pub fn broadcast(envelope: Envelope, iterations: u32) -> Self {
        Self {
            envelope,
            filter: Arc::new(|_| true),
            remaining_iterations: iterations,
            channel: None,
        }
    }

    /// Build a channel-scoped message: filter accepts only `members`.
    pub fn to_members(envelope: Envelope, channel: Vec<u8>, members: Vec<PkiId>, iterations: u32) -> Self {
        Self {
            envelope,
            filter: Arc::new(move |m| members.contains(&m.pki_id)),
            remaining_iterations: iterations,
            channel: Some(channel),
        }
    }

    /// Build a message addressed to a specific set of peers, outside any
    /// channel (used for unicast/targeted discovery traffic such as
    /// membership requests).
    pub fn to_peers(envelope: Envelope, members: Vec<PkiId>, iterations: u32) -> Self {
        Self {
            envelope,
            filter: Arc::new(move |m| members.contains(&m.pki_id)),
            remaining_iterations: iterations,
            channel: None,
        }
    }

    /// Build a message excluding a single peer (used for "filter = not
    /// sender" re-propagation, spec.md §4.7 step 2).
    pub fn excluding(envelope: Envelope, exclude: PkiId, iterations: u32) -> Self {
        Self {
            envelope,
            filter: Arc::new(move |m| m.pki_id != exclude),
            remaining_iterations: iterations,
            channel: None,
        }
    }
}

/// Tunables for the emitter.
#[derive(Clone, Copy, Debug)]
pub struct EmitterConfig {
    /// Burst size cap.
    pub max_burst_size: usize,
    /// Burst latency cap: time since the first buffered message.
    pub max_burst_latency: Duration,
}

/// Invoked with every burst the emitter flushes. The gossip service
/// implements this as "classify, select peers by filter, send" (spec.md
/// §4.3).
pub type EmitFn = Arc<dyn Fn(&[EmittedMessage]) + Send + Sync>;

#[derive(Default)]
struct Buffer {
    messages: Vec<EmittedMessage>,
    first_added_at: Option<Instant>,
}

/// The batching emitter. A single timer task owns the buffer; `add` is
/// mutex-guarded and never blocks longer than acquiring that mutex (spec.md
/// §4.3, §5).
pub struct Emitter {
    config: EmitterConfig,
    buffer: Mutex<Buffer>,
    notify: Notify,
    shutdown: Notify,
    stopped: std::sync::atomic::AtomicBool,
    emit: EmitFn,
}

impl Emitter {
    /// Construct an emitter. Does not start its timer task; call
    /// [`Emitter::spawn`].
    pub fn new(config: EmitterConfig, emit: EmitFn) -> Arc<Self> {
        Arc::new(Self {
            config,
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
            shutdown: Notify::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
            emit,
        })
    }

    /// Queue a message for propagation. Synchronous: holds the buffer's
    /// mutex only long enough to push and check the burst-size cap.
    pub fn add(&self, message: EmittedMessage) {
        let at_cap = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.first_added_at.is_none() {
                buffer.first_added_at = Some(Instant::now());
            }
            buffer.messages.push(message);
            buffer.messages.len() >= self.config.max_burst_size
        };
        if at_cap {
            self.notify.notify_one();
        }
    }

    /// Spawn the task driving burst emission. One task per emitter.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            let deadline = {
                let buffer = self.buffer.lock().unwrap();
                buffer
                    .first_added_at
                    .map(|t| t + self.config.max_burst_latency)
            };

            let sleep = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => {
                    self.flush();
                }
                _ = self.notify.notified() => {
                    self.flush();
                }
                _ = self.shutdown.notified() => {
                    self.flush();
                    break;
                }
            }
        }
    }

    fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.messages.is_empty() {
                return;
            }
            buffer.first_added_at = None;
            std::mem::take(&mut buffer.messages)
        };

        trace!(count = batch.len(), "flushing gossip burst");
        (self.emit)(&batch);

        let mut buffer = self.buffer.lock().unwrap();
        for mut message in batch {
            message.remaining_iterations = message.remaining_iterations.saturating_sub(1);
            if message.remaining_iterations > 0 {
                if buffer.first_added_at.is_none() {
                    buffer.first_added_at = Some(Instant::now());
                }
                buffer.messages.push(message);
            }
        }
    }

    /// Stop the emitter: drains one final burst, then the spawned task
    /// exits.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Current buffer occupancy, for diagnostics and tests.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().messages.len()
    }
}

impl Publisher for Emitter {
    fn publish(&self, message: EmittedMessage) {
        self.add(message);
    }
}
