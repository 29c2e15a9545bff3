//! Connection pooling.
//!
//! The pool is generic over the pooled resource and is driven entirely by
//! hooks (connect, disconnect, validate, check) supplied at construction, so
//! it can be exercised without a database. Capacity is enforced with a
//! semaphore; idle entries live behind a mutex and carry a use counter.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::driver::DriverInfo;
use crate::error::{Error, Msg, Result};

/// Produce a fresh resource.
pub type ConnectFn<C> = Box<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;
/// Dispose of a resource. Failures are the hook's problem; they are not
/// reported to the pool.
pub type DisconnectFn<C> = Box<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;
/// Check a resource on acquisition, re-establishing it if possible.
pub type ValidateFn<C> = Box<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, bool> + Send + Sync>;
/// Cheap usability test applied on release.
pub type CheckFn<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

// ============================================================================
// Sizing
// ============================================================================

/// Pool size limits.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Maximum number of outstanding resources.
    pub max_size: usize,
    /// Maximum number of idle resources retained.
    pub max_idle_size: usize,
    /// A resource is disposed of once it has been acquired this many times.
    pub max_use_count: u64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits {
            max_size: 8,
            max_idle_size: 8,
            max_use_count: 100,
        }
    }
}

/// Resolve the requested sizes against the argument rules: an unset pair
/// falls back to the driver default, `max_idle_size` cannot be given without
/// `max_size`, and `max_idle_size <= max_size` must hold.
pub(crate) fn resolve_sizes(
    max_size: Option<usize>,
    max_idle_size: Option<usize>,
    default_max_size: usize,
) -> std::result::Result<(usize, usize), String> {
    match (max_size, max_idle_size) {
        (None, None) => Ok((default_max_size, default_max_size)),
        (Some(n), None) => Ok((n, n)),
        (None, Some(_)) => Err("max_idle_size requires max_size".to_string()),
        (Some(n), Some(i)) if i <= n => Ok((n, i)),
        (Some(n), Some(i)) => Err(format!(
            "max_idle_size ({}) must not exceed max_size ({})",
            i, n
        )),
    }
}

/// Clamp the requested sizes to what the driver can support.
pub(crate) fn gate_sizes(info: &DriverInfo, max_size: usize, max_idle_size: usize) -> (usize, usize) {
    match (info.can_concur, info.can_pool) {
        (true, true) => (max_size, max_idle_size),
        // Concurrent but unpoolable: always connect fresh.
        (true, false) => (max_size, 0),
        (false, true) if max_idle_size == 0 => (1, 0),
        (false, true) => (1, 1),
        (false, false) => (1, 0),
    }
}

// ============================================================================
// Pool
// ============================================================================

struct Entry<C> {
    conn: C,
    use_count: u64,
}

struct PoolInner<C> {
    limits: PoolLimits,
    connect: ConnectFn<C>,
    disconnect: DisconnectFn<C>,
    validate: ValidateFn<C>,
    check: CheckFn<C>,
    idle: Mutex<Vec<Entry<C>>>,
    semaphore: Arc<Semaphore>,
}

/// A bounded pool of reusable resources.
pub struct Pool<C: Send + 'static> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Send + 'static> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> Pool<C> {
    pub fn new(
        limits: PoolLimits,
        connect: ConnectFn<C>,
        disconnect: DisconnectFn<C>,
        validate: ValidateFn<C>,
        check: CheckFn<C>,
    ) -> Pool<C> {
        Pool {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(limits.max_size)),
                limits,
                connect,
                disconnect,
                validate,
                check,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire a resource, waiting when the pool is at capacity. Idle
    /// entries are validated before reuse; entries that fail validation are
    /// disposed of and replaced with a fresh one.
    pub async fn acquire(&self) -> Result<Pooled<C>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectFailed {
                uri: String::new(),
                message: Msg::plain("Pool is closed."),
            })?;

        loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(mut entry) => {
                    if (self.inner.validate)(&mut entry.conn).await {
                        entry.use_count += 1;
                        return Ok(Pooled {
                            entry: Some(entry),
                            inner: Arc::clone(&self.inner),
                            _permit: permit,
                        });
                    }
                    (self.inner.disconnect)(entry.conn).await;
                }
                None => {
                    let conn = (self.inner.connect)().await?;
                    return Ok(Pooled {
                        entry: Some(Entry { conn, use_count: 1 }),
                        inner: Arc::clone(&self.inner),
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// The effective limits this pool enforces.
    pub fn limits(&self) -> PoolLimits {
        self.inner.limits
    }

    /// Number of idle resources currently retained.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Dispose of all idle resources. Outstanding ones are disposed of when
    /// they come back over the idle limit.
    pub async fn drain(&self) {
        let drained = std::mem::take(&mut *self.inner.idle.lock());
        for entry in drained {
            (self.inner.disconnect)(entry.conn).await;
        }
    }
}

// ============================================================================
// Pooled guard
// ============================================================================

/// A resource checked out of the pool.
///
/// Prefer [`Pooled::release`]; dropping the guard returns the resource on a
/// best-effort basis (the disposal hook then runs on a spawned task, or not
/// at all outside a runtime).
pub struct Pooled<C: Send + 'static> {
    entry: Option<Entry<C>>,
    inner: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send + 'static> Pooled<C> {
    /// Return the resource to the pool, disposing of it when it is unusable,
    /// worn out, or over the idle limit.
    pub async fn release(mut self) {
        if let Some(entry) = self.entry.take() {
            match self.inner.park(entry) {
                Ok(()) => {}
                Err(conn) => (self.inner.disconnect)(conn).await,
            }
        }
    }
}

impl<C: Send + 'static> PoolInner<C> {
    /// Park an entry in the idle list, or hand its resource back for
    /// disposal.
    fn park(&self, entry: Entry<C>) -> std::result::Result<(), C> {
        if entry.use_count >= self.limits.max_use_count || !(self.check)(&entry.conn) {
            return Err(entry.conn);
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.limits.max_idle_size {
            idle.push(entry);
            Ok(())
        } else {
            Err(entry.conn)
        }
    }
}

impl<C: Send + 'static> std::ops::Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.entry.as_ref().expect("pooled resource already released").conn
    }
}

impl<C: Send + 'static> std::ops::DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.entry.as_mut().expect("pooled resource already released").conn
    }
}

impl<C: Send + 'static> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Err(conn) = self.inner.park(entry) {
                let inner = Arc::clone(&self.inner);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { (inner.disconnect)(conn).await });
                }
                // Outside a runtime the resource is simply dropped.
            }
        }
    }
}
