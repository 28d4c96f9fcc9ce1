//! Invalidation listener
//!
//! A single dedicated thread (with its own current-thread runtime) holds the
//! subscription to the invalidation channel. For every message it re-reads
//! the key from L2 and writes the result, or a negative entry, into the
//! category's L1 cache. Messages are handled one at a time, so invalidations
//! are applied in channel order.
//!
//! Lifecycle:
//!
//! ```text
//!            start
//!              |
//!              v
//!        +-------------+   error / stream closed   +----------+
//!        | Subscribing | ------------------------> | Retrying |
//!        +-------------+ <------------------------ +----------+
//!              |            backoff elapsed              |
//!              |  cancelled                   cancelled  |
//!              v                                         v
//!        +------------------------------------------------------+
//!        |                      Terminated                      |
//!        +------------------------------------------------------+
//! ```
//!
//! Both the wait on the subscription and the backoff pause are raced against
//! a [`CancellationToken`], so [`InvalidationListener::shutdown`] never waits
//! on the transport to unblock by itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::local::LocalCacheRegistry;
use crate::remote::RemoteCache;
use crate::{CacheEntry, CacheError};

const THREAD_NAME: &str = "tiercache-listener";

/// How often `shutdown` checks whether the thread has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Observable listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Subscribing = 0,
    Retrying = 1,
    Terminated = 2,
}

impl ListenerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Subscribing,
            1 => Self::Retrying,
            _ => Self::Terminated,
        }
    }
}

/// State shared between the listener thread and its owner
struct Shared {
    stop_flag: AtomicBool,
    state: AtomicU8,
    processed: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }
}

/// Handle to the background listener thread.
pub struct InvalidationListener {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    config: ListenerConfig,
}

impl InvalidationListener {
    /// Spawn the listener thread. It starts in [`ListenerState::Subscribing`].
    ///
    /// The thread's runtime is built here, so a failure to create it is
    /// returned to the caller instead of ending the thread silently.
    pub fn start(
        remote: Arc<RemoteCache>,
        registry: Arc<LocalCacheRegistry>,
        config: ListenerConfig,
        negative_ttl_ms: Option<u64>,
    ) -> Result<Self, CacheError> {
        let shared = Arc::new(Shared {
            stop_flag: AtomicBool::new(false),
            state: AtomicU8::new(ListenerState::Subscribing as u8),
            processed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            remote,
            registry,
            backoff: config.backoff(),
            negative_ttl_ms,
        };

        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CacheError::config(format!("failed to build listener runtime: {e}")))?;

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                rt.block_on(worker.run());
                worker.shared.set_state(ListenerState::Terminated);
            })
            .map_err(|e| CacheError::config(format!("failed to spawn listener thread: {e}")))?;

        Ok(Self {
            shared,
            handle: Some(handle),
            config,
        })
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Number of invalidation messages applied so far.
    pub fn messages_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the listener and wait for its thread to exit.
    ///
    /// Sets the stop flag and cancels the token, then polls for thread exit
    /// for up to `shutdown_grace` per attempt, re-cancelling between
    /// attempts. After `shutdown_attempts` the thread is detached and an
    /// error is logged. Always returns.
    pub async fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.stop_flag.store(true, Ordering::SeqCst);
        let attempts = self.config.shutdown_attempts.max(1);

        for attempt in 1..=attempts {
            self.shared.cancel.cancel();
            if wait_for_exit(&handle, self.config.shutdown_grace()).await {
                if handle.join().is_err() {
                    error!("Invalidation listener thread panicked");
                }
                info!("Invalidation listener stopped");
                return;
            }
            warn!(
                "Invalidation listener still running after shutdown attempt {}/{}",
                attempt, attempts
            );
        }

        error!(
            "Invalidation listener did not exit after {} attempts; detaching thread",
            attempts
        );
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shared.stop_flag.store(true, Ordering::SeqCst);
            self.shared.cancel.cancel();
        }
    }
}

async fn wait_for_exit(handle: &JoinHandle<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if handle.is_finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Runs on the listener thread.
struct Worker {
    shared: Arc<Shared>,
    remote: Arc<RemoteCache>,
    registry: Arc<LocalCacheRegistry>,
    backoff: Duration,
    negative_ttl_ms: Option<u64>,
}

impl Worker {
    async fn run(&self) {
        let cancel = self.shared.cancel.clone();

        while !self.shared.stopping() {
            self.shared.set_state(ListenerState::Subscribing);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.listen() => result,
            };

            if let Err(e) = result {
                if self.shared.stopping() {
                    break;
                }
                error!(
                    "Invalidation listener error: {}. Retrying in {:?}",
                    e, self.backoff
                );
                self.shared.set_state(ListenerState::Retrying);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        debug!("Invalidation listener loop exited");
    }

    /// Subscribe and apply messages until the subscription fails or ends.
    async fn listen(&self) -> Result<(), CacheError> {
        let mut messages = self.remote.subscribe().await?;
        info!("Invalidation listener subscribed");

        while let Some(payload) = messages.next().await {
            self.apply(&payload).await;
            self.shared.processed.fetch_add(1, Ordering::SeqCst);
        }

        Err(CacheError::Transport("subscription closed".to_owned()))
    }

    async fn apply(&self, payload: &[u8]) {
        let message = match self.remote.decode_message(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Invalidation listener: failed to decode payload: {}", e);
                return;
            }
        };
        let full_key = match message.full_key() {
            Ok(k) => k,
            Err(e) => {
                warn!("Invalidation listener: ignoring message {:?}: {}", message, e);
                return;
            }
        };

        let entry = match self.remote.get(&full_key).await {
            Some(entry) => entry,
            None => CacheEntry::negative(self.negative_ttl_ms),
        };

        match self.registry.cache(&message.category) {
            Ok(cache) => {
                debug!(
                    "Cache invalidation received, refreshing L1 key {} (negative: {})",
                    full_key,
                    entry.is_negative()
                );
                cache.set(&full_key, entry).await;
            }
            Err(e) => warn!("Invalidation listener: no L1 cache for {}: {}", full_key, e),
        }
    }
}
