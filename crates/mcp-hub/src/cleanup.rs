use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::ConnectionHandles;

pub const DEFAULT_CLEANUP_WORKERS: usize = 4;
pub const DEFAULT_CLEANUP_CAPACITY: usize = 64;
/// Upper bound on one release; a stuck server is abandoned after this.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

struct ReleaseJob {
    name: String,
    handles: ConnectionHandles,
}

/// Background release of connection handles.
///
/// Teardown hands the handles over and returns at once. A fixed set of
/// workers closes them; outcomes are logged and otherwise ignored.
pub struct CleanupQueue {
    tx: parking_lot::Mutex<Option<mpsc::Sender<ReleaseJob>>>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    release_timeout: Duration,
}

impl CleanupQueue {
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, capacity: usize, release_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<ReleaseJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let pending = pending.clone();
                let idle = idle.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        release(job, release_timeout).await;
                        finish(&pending, &idle);
                    }
                    debug!("MCP cleanup worker {} stopped", worker);
                })
            })
            .collect();

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(handles),
            pending,
            idle,
            release_timeout,
        }
    }

    /// Queue handles for release. Never waits.
    pub fn submit(&self, name: &str, handles: ConnectionHandles) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = ReleaseJob {
            name: name.to_string(),
            handles,
        };

        let sender = self.tx.lock().clone();
        let job = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(job)) => {
                    warn!("MCP cleanup queue is full, releasing '{}' on a detached task", job.name);
                    job
                }
                Err(mpsc::error::TrySendError::Closed(job)) => job,
            },
            None => job,
        };

        let pending = self.pending.clone();
        let idle = self.idle.clone();
        let release_timeout = self.release_timeout;
        tokio::spawn(async move {
            release(job, release_timeout).await;
            finish(&pending, &idle);
        });
    }

    /// Releases submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted release has finished. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }

    /// Stop accepting work and give the workers `timeout` to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tx.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();

        let drained = tokio::time::timeout(timeout, futures::future::join_all(workers)).await;
        match drained {
            Ok(_) => info!("MCP cleanup queue drained"),
            Err(_) => warn!(
                "MCP cleanup queue still had {} releases after {:?}",
                self.pending(),
                timeout
            ),
        }
    }
}

fn finish(pending: &AtomicUsize, idle: &Notify) {
    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

async fn release(job: ReleaseJob, timeout: Duration) {
    let ReleaseJob { name, handles } = job;
    let closing = async {
        if let Err(e) = handles.client.close().await {
            debug!("Closing client for MCP server '{}' failed: {}", name, e);
        }
        if let Err(e) = handles.transport.close().await {
            debug!("Closing transport for MCP server '{}' failed: {}", name, e);
        }
    };

    match tokio::time::timeout(timeout, closing).await {
        Ok(()) => debug!("Released MCP server '{}'", name),
        Err(_) => warn!(
            "Releasing MCP server '{}' took longer than {:?}, abandoning it",
            name, timeout
        ),
    }
}
