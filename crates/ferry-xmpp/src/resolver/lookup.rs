//! Blocking host-name lookups isolated on worker threads.
//!
//! The system resolver call is not reentrant, so every lookup runs on its own
//! blocking thread and takes a process-wide lock around the call itself.
//! Callers own lookups through opaque handles; cancelling a lookup clears the
//! owner slot and the eventual result is thrown away.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use crate::error::ConnectionError;

/// Serializes calls into the platform resolver.
static NATIVE_RESOLVER: Mutex<()> = Mutex::new(());

type LookupResult = std::io::Result<Vec<SocketAddr>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupHandle(u64);

struct RegistryInner {
    owners: DashMap<LookupHandle, oneshot::Sender<LookupResult>>,
    next_handle: AtomicU64,
    running: AtomicBool,
}

/// Owner of all in-flight blocking lookups.
///
/// Create one with [`LookupRegistry::init`], hand clones to the components
/// that resolve names, and call [`LookupRegistry::shutdown`] when done.
#[derive(Clone)]
pub struct LookupRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for LookupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupRegistry")
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LookupRegistry {
    pub fn init() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                owners: DashMap::new(),
                next_handle: AtomicU64::new(1),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Stop accepting lookups and detach every pending owner.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let detached = self.inner.owners.len();
        self.inner.owners.clear();
        debug!(detached, "lookup registry shut down");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of lookups that still have an owner.
    pub fn pending(&self) -> usize {
        self.inner.owners.len()
    }

    /// Start resolving `host` on a worker thread.
    #[instrument(skip(self), name = "lookup.start")]
    pub fn start(&self, host: &str, port: u16) -> Result<PendingLookup, ConnectionError> {
        if !self.is_running() {
            return Err(ConnectionError::HostNotFound(format!(
                "lookup registry is shut down, cannot resolve {host}"
            )));
        }

        let handle = LookupHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.owners.insert(handle, tx);

        let inner = Arc::clone(&self.inner);
        let host_owned = host.to_string();
        tokio::task::spawn_blocking(move || {
            let result = {
                let _guard = NATIVE_RESOLVER
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                (host_owned.as_str(), port)
                    .to_socket_addrs()
                    .map(|addrs| addrs.collect::<Vec<_>>())
            };

            match inner.owners.remove(&handle) {
                Some((_, owner)) => {
                    let _ = owner.send(result);
                }
                None => trace!(host = %host_owned, "discarding result of detached lookup"),
            }
        });

        Ok(PendingLookup {
            handle,
            rx,
            registry: self.clone(),
        })
    }

    /// Detach the owner of `handle`. The worker keeps running.
    pub fn cancel(&self, handle: LookupHandle) {
        if self.inner.owners.remove(&handle).is_some() {
            debug!(?handle, "lookup detached");
        }
    }

    /// Resolve `host` and wait for the result.
    pub async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectionError> {
        self.start(host, port)?.wait().await
    }
}

/// A lookup owned by the caller. Dropping it detaches the owner.
pub struct PendingLookup {
    handle: LookupHandle,
    rx: oneshot::Receiver<LookupResult>,
    registry: LookupRegistry,
}

impl PendingLookup {
    pub fn handle(&self) -> LookupHandle {
        self.handle
    }

    pub async fn wait(mut self) -> Result<Vec<SocketAddr>, ConnectionError> {
        let result = (&mut self.rx).await;
        match result {
            Ok(Ok(addrs)) if !addrs.is_empty() => Ok(addrs),
            Ok(Ok(_)) => Err(ConnectionError::HostNotFound(
                "name resolved to no addresses".to_string(),
            )),
            Ok(Err(error)) => Err(ConnectionError::HostNotFound(error.to_string())),
            Err(_) => Err(ConnectionError::HostNotFound("lookup was cancelled".to_string())),
        }
    }
}

impl Drop for PendingLookup {
    fn drop(&mut self) {
        self.registry.cancel(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let registry = LookupRegistry::init();
        let addrs = registry.lookup("127.0.0.1", 5222).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:5222".parse().unwrap()]);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn cancelled_lookup_reports_host_not_found() {
        let registry = LookupRegistry::init();
        let guard = NATIVE_RESOLVER.lock().unwrap();
        let pending = registry.start("127.0.0.1", 5222).unwrap();
        registry.cancel(pending.handle());
        drop(guard);

        let result = pending.wait().await;
        assert!(matches!(result, Err(ConnectionError::HostNotFound(_))));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn dropping_a_lookup_detaches_it() {
        let registry = LookupRegistry::init();
        let pending = registry.start("localhost", 5222).unwrap();
        drop(pending);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_lookups() {
        let registry = LookupRegistry::init();
        registry.shutdown();
        assert!(!registry.is_running());
        assert!(matches!(
            registry.start("localhost", 5222),
            Err(ConnectionError::HostNotFound(_))
        ));
    }
}
