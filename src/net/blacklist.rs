//! Per-host failure state and the deferred-command queue.
//!
//! When a phase-2 or mass-delete broadcast cannot reach a host, the command
//! is queued against that host and the host is blacklisted with exponential
//! backoff. A background reaper redelivers pending commands once the
//! blacklist expires. All of this is in-memory: if the process dies, the XA
//! log carries the commitment intent and recovery replays it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::core::errors::Result;
use crate::dml::MassDeleteRequest;
use crate::log::TxId;

#[derive(Debug, Clone)]
pub enum DeferredCommand {
    Commit,
    Rollback,
    MassDelete(MassDeleteRequest),
}

#[derive(Debug, Clone)]
pub struct DeferredOp {
    pub tx: TxId,
    pub command: DeferredCommand,
}

#[derive(Debug)]
struct HostState {
    until: Instant,
    strikes: u32,
    pending: VecDeque<DeferredOp>,
}

/// Process-wide host → (blacklisted?, pending ops) map.
pub struct Blacklist {
    base: Duration,
    inner: Mutex<HashMap<String, HostState>>,
}

impl Blacklist {
    pub fn new(base: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(10)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self, strikes: u32) -> Duration {
        // exponential, capped at ~2^10 * base
        self.base * 2u32.saturating_pow(strikes.min(10))
    }

    /// Mark a host unreachable, extending its expiry exponentially.
    pub fn blacklist(&self, host: &str) {
        let mut inner = self.inner.lock();
        let state = inner.entry(host.to_string()).or_insert_with(|| HostState {
            until: Instant::now(),
            strikes: 0,
            pending: VecDeque::new(),
        });
        state.until = Instant::now() + self.backoff(state.strikes);
        state.strikes += 1;
        warn!(host, strikes = state.strikes, "host blacklisted");
    }

    /// Queue a command for redelivery once the host comes back.
    pub fn defer(&self, host: &str, op: DeferredOp) {
        let mut inner = self.inner.lock();
        let state = inner.entry(host.to_string()).or_insert_with(|| HostState {
            until: Instant::now(),
            strikes: 0,
            pending: VecDeque::new(),
        });
        state.pending.push_back(op);
    }

    pub fn is_blacklisted(&self, host: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .get(host)
            .map(|s| s.until > Instant::now())
            .unwrap_or(false)
    }

    pub fn pending_count(&self, host: &str) -> usize {
        self.inner
            .lock()
            .get(host)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// Hosts whose blacklist has expired, with their queued ops drained.
    fn take_due(&self) -> Vec<(String, Vec<DeferredOp>)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        for (host, state) in inner.iter_mut() {
            if state.until <= now && !state.pending.is_empty() {
                due.push((host.clone(), state.pending.drain(..).collect()));
            }
        }
        due
    }

    /// Put back ops whose redelivery failed and extend the backoff.
    fn requeue_front(&self, host: &str, ops: Vec<DeferredOp>) {
        {
            let mut inner = self.inner.lock();
            if let Some(state) = inner.get_mut(host) {
                for op in ops.into_iter().rev() {
                    state.pending.push_front(op);
                }
            } else {
                let mut pending = VecDeque::new();
                pending.extend(ops);
                inner.insert(
                    host.to_string(),
                    HostState { until: Instant::now(), strikes: 0, pending },
                );
            }
        }
        self.blacklist(host);
    }
}

/// Delivers one deferred command to one host. Implemented by the tree
/// dispatcher.
pub trait RetrySender: Send + Sync {
    fn deliver(&self, host: &str, op: &DeferredOp) -> Result<()>;
}

/// Background reaper redelivering expired hosts' queues.
pub struct RetryWorker {
    stop: Arc<AtomicBool>,
    signal: Arc<(Mutex<()>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl RetryWorker {
    pub fn spawn(
        blacklist: Arc<Blacklist>,
        sender: Arc<dyn RetrySender>,
        poll: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Arc::new((Mutex::new(()), Condvar::new()));
        let handle = {
            let stop = Arc::clone(&stop);
            let signal = Arc::clone(&signal);
            std::thread::Builder::new()
                .name("blacklist-reaper".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        for (host, ops) in blacklist.take_due() {
                            let mut failed = Vec::new();
                            let mut delivered = 0usize;
                            for op in ops {
                                if !failed.is_empty() {
                                    failed.push(op);
                                    continue;
                                }
                                match sender.deliver(&host, &op) {
                                    Ok(()) => delivered += 1,
                                    Err(e) => {
                                        warn!(host, error = %e, "deferred redelivery failed");
                                        failed.push(op);
                                    }
                                }
                            }
                            if delivered > 0 {
                                info!(host, delivered, "deferred commands redelivered");
                            }
                            if !failed.is_empty() {
                                blacklist.requeue_front(&host, failed);
                            }
                        }
                        let (lock, condvar) = &*signal;
                        let mut guard = lock.lock();
                        condvar.wait_for(&mut guard, poll);
                    }
                })
                .expect("spawning the blacklist reaper never fails")
        };
        Self { stop, signal, handle: Some(handle) }
    }
}

impl Drop for RetryWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.signal.1.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
