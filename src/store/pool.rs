//! Shared store-client pool.
//!
//! One pool holds one connection per `(url, api key, headers)` scope,
//! shared by every concurrent user of a tree. Leases are counted; an
//! idle connection is torn down and rebuilt by [`ClientPool::restart_if_idle`],
//! which drains active leases with a bounded no-progress wait and blocks
//! new leases behind a gate while the restart is in progress.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::core::store::StoreConnection;
use crate::error::{Error, Result};

use super::http::HttpStoreFactory;

/// How long a restart waits with no lease-count progress before forcing.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Creates connections for the pool; called on start and on every restart.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>>;
}

struct PoolInner {
    factory: Box<dyn ConnectionFactory>,
    client_timeout: Duration,
    drain_timeout: Duration,
    connection: Mutex<Option<Arc<dyn StoreConnection>>>,
    in_use: AtomicUsize,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
    // true = leases may proceed; false = restart in progress
    gate: watch::Sender<bool>,
}

/// Shared handle to the store with ref-counted usage, idle timeout and
/// safe restart.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(factory: Box<dyn ConnectionFactory>, client_timeout: Duration) -> Self {
        let (gate, _) = watch::channel(true);
        ClientPool {
            inner: Arc::new(PoolInner {
                factory,
                client_timeout,
                drain_timeout: DRAIN_TIMEOUT,
                connection: Mutex::new(None),
                in_use: AtomicUsize::new(0),
                last_used: Mutex::new(Instant::now()),
                closed: AtomicBool::new(false),
                gate,
            }),
        }
    }

    /// Pool backed by the HTTP store client described by `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if !settings.has_store() {
            return Err(Error::Config(
                "No store URL configured; set store_url (or wcd_url)".into(),
            ));
        }
        Ok(ClientPool::new(
            Box::new(HttpStoreFactory::from_settings(settings)?),
            settings.client_timeout,
        ))
    }

    #[cfg(test)]
    pub(crate) fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("pool not yet shared")
            .drain_timeout = drain_timeout;
        self
    }

    /// Number of leases currently out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    /// Establish the connection if it is not up yet.
    pub async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Store("Client pool is closed".into()));
        }
        let already_up = self.inner.connection.lock().expect("pool lock").is_some();
        if already_up {
            return Ok(());
        }
        let connection = self.inner.factory.connect().await?;
        *self.inner.connection.lock().expect("pool lock") = Some(connection);
        debug!("Store connection established");
        Ok(())
    }

    /// Borrow the connection. Waits while a restart is in progress.
    pub async fn lease(&self) -> Result<StoreLease> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::Store("Client pool is closed".into()));
            }
            let mut gate = self.inner.gate.subscribe();
            if *gate.borrow() {
                break;
            }
            gate.changed()
                .await
                .map_err(|_| Error::Internal("Client pool gate dropped".into()))?;
        }

        self.start().await?;
        let connection = self
            .inner
            .connection
            .lock()
            .expect("pool lock")
            .clone()
            .ok_or_else(|| Error::Store("Store connection unavailable".into()))?;

        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(StoreLease {
            connection,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Borrow the connection from a non-async context.
    ///
    /// Must not be called from inside an async runtime; use [`lease`]
    /// there instead.
    ///
    /// [`lease`]: ClientPool::lease
    pub fn lease_blocking(&self) -> Result<StoreLease> {
        futures::executor::block_on(self.lease())
    }

    /// Tear down and reconstruct the connection when it has been idle
    /// longer than the configured client timeout.
    ///
    /// Waits for active leases to drain; after `drain_timeout` with no
    /// progress the counter is force-zeroed with a warning and the
    /// connection is rebuilt anyway. New leases block until the restart
    /// completes.
    pub async fn restart_if_idle(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let idle_for = self.inner.last_used.lock().expect("pool lock").elapsed();
        if idle_for < self.inner.client_timeout {
            return Ok(());
        }

        // Another restart already holds the gate: just wait for it.
        if !*self.inner.gate.borrow() {
            let mut gate = self.inner.gate.subscribe();
            while !*gate.borrow() {
                gate.changed()
                    .await
                    .map_err(|_| Error::Internal("Client pool gate dropped".into()))?;
            }
            return Ok(());
        }

        debug!(idle = ?idle_for, "Restarting idle store connection");
        let _ = self.inner.gate.send(false);

        let mut last_count = self.inner.in_use.load(Ordering::SeqCst);
        let mut no_progress = Duration::ZERO;
        while self.inner.in_use.load(Ordering::SeqCst) > 0 {
            let current = self.inner.in_use.load(Ordering::SeqCst);
            if current != last_count {
                last_count = current;
                no_progress = Duration::ZERO;
            }
            if no_progress >= self.inner.drain_timeout {
                warn!(
                    in_use = current,
                    "Store client restart timed out waiting for leases; forcing"
                );
                self.inner.in_use.store(0, Ordering::SeqCst);
                break;
            }
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
            no_progress += DRAIN_CHECK_INTERVAL;
        }

        *self.inner.connection.lock().expect("pool lock") = None;
        let result = self.inner.factory.connect().await;
        match result {
            Ok(connection) => {
                *self.inner.connection.lock().expect("pool lock") = Some(connection);
                *self.inner.last_used.lock().expect("pool lock") = Instant::now();
                let _ = self.inner.gate.send(true);
                Ok(())
            }
            Err(err) => {
                // Reopen the gate so waiters fail fast instead of hanging.
                let _ = self.inner.gate.send(true);
                Err(err)
            }
        }
    }

    /// Drain and terminate the connection. Subsequent leases fail.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.gate.send(true);
        *self.inner.connection.lock().expect("pool lock") = None;
        debug!("Store connection pool closed");
    }
}

/// A counted borrow of the store connection. Dropping the lease releases
/// it and refreshes the idle timer.
pub struct StoreLease {
    connection: Arc<dyn StoreConnection>,
    inner: Arc<PoolInner>,
}

impl Deref for StoreLease {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        // Saturating: a lease outliving a forced restart must not wrap
        // the counter.
        let _ = self
            .inner
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        *self.inner.last_used.lock().expect("pool lock") = Instant::now();
    }
}
