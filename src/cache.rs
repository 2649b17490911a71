use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::task::AbortHandle;
use tracing::*;
use uuid::Uuid;

use crate::auth;
use crate::client::handler::{ClientHandler, HostKeyPolicy, Transport};
use crate::config::{CacheConfig, SshTargetOptions};
use crate::dial;
use crate::error::SshError;

/// Identity under which transports are shared: two targets with equal keys
/// may multiplex their sessions over one authenticated transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub proxy_command: Option<String>,
}

impl EndpointKey {
    fn from_options(options: &SshTargetOptions) -> Self {
        Self {
            host: options.host.clone(),
            port: options.port,
            username: options.username.clone(),
            proxy_command: options.proxy_command.clone(),
        }
    }
}

/// A borrowed transport. Must be given back with
/// [`ConnectionCache::release`]; release consumes the borrow, so a transport
/// cannot be released twice.
pub struct CachedTransport {
    id: Uuid,
    handle: Arc<Transport>,
}

impl CachedTransport {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &Arc<Transport> {
        &self.handle
    }
}

impl std::fmt::Debug for CachedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CachedTransport({})", self.id)
    }
}

struct PoolEntry {
    id: Uuid,
    handle: Arc<Transport>,
    /// Number of live sessions borrowed from this transport.
    channels: usize,
}

#[derive(Default)]
struct CacheState {
    pool: HashMap<EndpointKey, Vec<PoolEntry>>,
    owners: HashMap<Uuid, EndpointKey>,
    timers: HashMap<Uuid, AbortHandle>,
    close_timeout: Duration,
    max_channels: usize,
}

/// Point-in-time view of the pool, mostly for logging and tests.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Per-endpoint list of per-transport session counts.
    pub entries: HashMap<EndpointKey, Vec<usize>>,
    pub pending_closes: usize,
}

impl CacheStats {
    pub fn entry_count(&self, key: &EndpointKey) -> usize {
        self.entries.get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn session_count(&self, key: &EndpointKey) -> usize {
        self.entries
            .get(key)
            .map(|counts| counts.iter().sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pools authenticated SSH transports keyed on [`EndpointKey`].
///
/// `get` hands out an existing transport while it has spare channel capacity
/// and dials a new one otherwise; `release` gives it back, and a transport
/// whose last borrower left is kept alive for `close_timeout` before being
/// torn down, so bursts of short-lived commands reuse one handshake.
///
/// All bookkeeping happens under one mutex; dialing, handshakes and closes
/// happen outside it. Everything here expects to run inside a tokio runtime.
pub struct ConnectionCache {
    name: String,
    caching: bool,
    state: Arc<Mutex<CacheState>>,
}

fn lock(state: &Arc<Mutex<CacheState>>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionCache {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            caching: true,
            state: Arc::new(Mutex::new(CacheState {
                close_timeout: config.close_timeout,
                max_channels: config.max_channels,
                ..Default::default()
            })),
        }
    }

    /// A cache that never pools: `get` always dials a fresh transport and
    /// `release` closes it right away.
    pub fn uncached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            caching: false,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow a transport for `options`, reusing a pooled one when possible.
    ///
    /// A failure never leaves a partial entry behind: the transport is only
    /// inserted into the pool after dial, handshake and authentication have
    /// all succeeded.
    pub async fn get(&self, options: &SshTargetOptions) -> Result<CachedTransport, SshError> {
        let key = EndpointKey::from_options(options);

        if self.caching {
            let mut state = lock(&self.state);
            let max_channels = state.max_channels;
            let mut reused = None;
            if let Some(entries) = state.pool.get_mut(&key) {
                if let Some(entry) = entries.iter_mut().find(|e| e.channels < max_channels) {
                    entry.channels += 1;
                    reused = Some((entry.id, entry.handle.clone(), entry.channels));
                }
            }
            if let Some((id, handle, channels)) = reused {
                if let Some(timer) = state.timers.remove(&id) {
                    timer.abort();
                }
                debug!(
                    cache = %self.name,
                    transport = %id,
                    host = %key.host,
                    port = key.port,
                    channels,
                    "reusing pooled transport"
                );
                return Ok(CachedTransport { id, handle });
            }
        }

        let handle = Arc::new(self.open_transport(options).await?);
        let id = Uuid::new_v4();
        info!(
            cache = %self.name,
            transport = %id,
            host = %options.host,
            port = options.port,
            username = %options.username,
            "opened new transport"
        );

        if self.caching {
            let mut state = lock(&self.state);
            state.pool.entry(key.clone()).or_default().push(PoolEntry {
                id,
                handle: handle.clone(),
                channels: 1,
            });
            state.owners.insert(id, key);
        }

        Ok(CachedTransport { id, handle })
    }

    /// Give back a borrowed transport. When its last borrower leaves, a
    /// deferred close is scheduled instead of closing synchronously, so an
    /// immediate re-`get` can cancel it and reuse the transport.
    pub fn release(&self, transport: CachedTransport) {
        let CachedTransport { id, handle } = transport;

        let mut state = lock(&self.state);
        let Some(key) = state.owners.get(&id).cloned() else {
            drop(state);
            // Untracked: either this cache never pools, or a flush already
            // tore the entry down while the session was still out.
            if self.caching {
                debug!(cache = %self.name, transport = %id, "released transport is no longer pooled");
            } else {
                debug!(cache = %self.name, transport = %id, "closing uncached transport");
                tokio::spawn(async move {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "")
                        .await;
                });
            }
            return;
        };

        let mut remaining = None;
        if let Some(entries) = state.pool.get_mut(&key) {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                entry.channels = entry.channels.saturating_sub(1);
                remaining = Some(entry.channels);
            }
        }
        let Some(remaining) = remaining else {
            return;
        };

        debug!(
            cache = %self.name,
            transport = %id,
            channels = remaining,
            "released transport"
        );

        if remaining == 0 && !state.timers.contains_key(&id) {
            let timeout = state.close_timeout;
            let shared = self.state.clone();
            let name = self.name.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(entry) = take_idle_entry(&shared, id) else {
                    // A get() cancelled us between firing and locking.
                    return;
                };
                debug!(cache = %name, transport = %id, "closing idle transport");
                let _ = entry
                    .handle
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await;
            });
            state.timers.insert(id, task.abort_handle());
        }
    }

    async fn open_transport(&self, options: &SshTargetOptions) -> Result<Transport, SshError> {
        let stream = dial::connect(
            &options.host,
            options.port,
            options.proxy_command.as_deref(),
        )
        .await?;

        let config = Arc::new(russh::client::Config::default());
        let handler = ClientHandler {
            policy: HostKeyPolicy::AcceptAny,
        };
        let mut handle = russh::client::connect_stream(config, stream, handler).await?;

        if let Err(error) = auth::authenticate(&mut handle, &options.username, &options.auth).await
        {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            return Err(error);
        }

        Ok(handle)
    }

    /// Tear down every pooled transport, in use or not. Outstanding sessions
    /// observe errors on their next I/O.
    pub async fn flush(&self) {
        let entries: Vec<PoolEntry> = {
            let mut state = lock(&self.state);
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.owners.clear();
            state.pool.drain().flat_map(|(_, entries)| entries).collect()
        };

        info!(cache = %self.name, transports = entries.len(), "flushing");
        futures::future::join_all(entries.into_iter().map(|entry| async move {
            let _ = entry
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }))
        .await;
    }

    /// Applies to subsequent releases only.
    pub fn set_close_timeout(&self, timeout: Duration) {
        lock(&self.state).close_timeout = timeout;
    }

    /// Applies to subsequent gets only.
    pub fn set_max_channels(&self, max_channels: usize) {
        lock(&self.state).max_channels = max_channels;
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            entries: state
                .pool
                .iter()
                .map(|(key, entries)| {
                    (
                        key.clone(),
                        entries.iter().map(|e| e.channels).collect::<Vec<_>>(),
                    )
                })
                .collect(),
            pending_closes: state.timers.len(),
        }
    }
}

/// Remove the entry for `id` if its deferred close is still pending. Returns
/// `None` when a concurrent `get` cancelled the close first.
fn take_idle_entry(state: &Arc<Mutex<CacheState>>, id: Uuid) -> Option<PoolEntry> {
    let mut state = lock(state);
    state.timers.remove(&id)?;
    let key = state.owners.remove(&id)?;
    let entries = state.pool.get_mut(&key)?;
    let index = entries.iter().position(|e| e.id == id)?;
    let entry = entries.remove(index);
    if entries.is_empty() {
        state.pool.remove(&key);
    }
    Some(entry)
}

lazy_static! {
    static ref GLOBAL_CACHE: RwLock<Arc<ConnectionCache>> = RwLock::new(Arc::new(
        ConnectionCache::new("global SSH connection cache", CacheConfig::default())
    ));
}

fn global_slot() -> &'static RwLock<Arc<ConnectionCache>> {
    &GLOBAL_CACHE
}

/// The process-wide cache used when a constructor is not handed one.
pub fn global_cache() -> Arc<ConnectionCache> {
    global_slot()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Install a fresh process-wide cache. Transports pooled in the previous one
/// are closed as their pending timers fire or their borrowers release them.
pub fn enable_global_caching(config: CacheConfig) {
    let cache = Arc::new(ConnectionCache::new("global SSH connection cache", config));
    *global_slot()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = cache;
}

/// Replace the process-wide cache with a non-pooling one, flushing whatever
/// the previous cache still held.
pub async fn disable_global_caching() {
    let previous = {
        let mut slot = global_slot()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(
            &mut *slot,
            Arc::new(ConnectionCache::uncached("global SSH uncached connections")),
        )
    };
    previous.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_identity() {
        let a = EndpointKey::from_options(&SshTargetOptions::new("localhost"));
        let b = EndpointKey::from_options(&SshTargetOptions::new("localhost"));
        assert_eq!(a, b);

        let mut options = SshTargetOptions::new("localhost");
        options.proxy_command = Some("nc %h %p".to_owned());
        let c = EndpointKey::from_options(&options);
        assert_ne!(a, c);
    }

    #[test]
    fn stats_of_fresh_cache_are_empty() {
        let cache = ConnectionCache::new("test", CacheConfig::default());
        let stats = cache.stats();
        assert!(stats.is_empty());
        assert_eq!(stats.pending_closes, 0);
    }
}
