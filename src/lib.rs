//! dbkit: polymorphic database access with a native PostgreSQL driver.
//!
//! Drivers are resolved from the URI scheme through a process-wide registry.
//! Queries are described by [`Request`] values carrying first-class type
//! descriptors; the driver walks the descriptors to bind parameters and
//! decode rows. Connections can be used directly, scoped through
//! [`with_connection`], or managed by a [`Pool`] built with [`connect_pool`].

pub mod config;
pub mod driver;
pub mod error;
pub mod pg;
pub mod pool;
pub mod request;
pub mod types;

pub use config::{Config, EnvFn, NoticeHandler};
pub use driver::{Connection, Driver, DriverInfo, RawRow, Response, RowStream};
pub use error::{cause_of_sqlstate, Cause, ConnectionFault, Error, Msg, Result, ServerMsg};
pub use pool::{Pool, PoolLimits, Pooled};
pub use request::{Mult, QueryTemplate, Request};
pub use types::{CustomCodec, FieldType, Type, Value};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

// ============================================================================
// Driver registry
// ============================================================================

type DiscoverFn = Box<dyn Fn(&str) -> Option<Arc<dyn Driver>> + Send + Sync>;

static DRIVERS: Lazy<RwLock<HashMap<String, Arc<dyn Driver>>>> = Lazy::new(|| {
    let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
    let postgres: Arc<dyn Driver> = Arc::new(pg::PostgresDriver);
    drivers.insert("postgresql".to_string(), Arc::clone(&postgres));
    drivers.insert("postgres".to_string(), postgres);
    RwLock::new(drivers)
});

static DISCOVERY: Lazy<Mutex<Option<DiscoverFn>>> = Lazy::new(|| Mutex::new(None));
static DISCOVERY_TRIED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Register a driver for a URI scheme. The registry grows monotonically;
/// registering an existing scheme replaces the entry.
pub fn register_driver(scheme: &str, driver: Arc<dyn Driver>) {
    DRIVERS.write().insert(scheme.to_string(), driver);
}

/// Install the discovery hook consulted at most once per unknown scheme.
pub fn set_driver_discovery<F>(hook: F)
where
    F: Fn(&str) -> Option<Arc<dyn Driver>> + Send + Sync + 'static,
{
    *DISCOVERY.lock() = Some(Box::new(hook));
}

/// Resolve the driver for a URI.
pub fn load_driver(uri: &str) -> Result<Arc<dyn Driver>> {
    let scheme = config::uri_scheme(uri).ok_or_else(|| Error::LoadRejected {
        uri: uri.to_string(),
        message: "Missing URI scheme.".to_string(),
    })?;

    if let Some(driver) = DRIVERS.read().get(scheme) {
        return Ok(Arc::clone(driver));
    }

    if DISCOVERY_TRIED.lock().insert(scheme.to_string()) {
        let discovered = DISCOVERY.lock().as_ref().and_then(|hook| hook(scheme));
        if let Some(driver) = discovered {
            DRIVERS.write().insert(scheme.to_string(), Arc::clone(&driver));
            return Ok(driver);
        }
    }

    Err(Error::LoadRejected {
        uri: uri.to_string(),
        message: format!("No driver found for scheme {:?}.", scheme),
    })
}

// ============================================================================
// Facade
// ============================================================================

/// Open a connection to `uri`.
pub async fn connect(mut config: Config, uri: &str) -> Result<Box<dyn Connection>> {
    let driver = load_driver(uri)?;
    if let Some(version) = config.version_tweak().map(str::to_string) {
        config = config.set("tweaks_version", version);
    }
    driver.connect(&config, uri).await
}

/// Open a connection, run `f` on it, and disconnect on every exit path.
pub async fn with_connection<T, F>(config: Config, uri: &str, f: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut (dyn Connection + 'static)) -> BoxFuture<'c, Result<T>>,
{
    let mut conn = connect(config, uri).await?;
    let outcome = f(conn.as_mut()).await;
    conn.disconnect().await;
    outcome
}

/// The post-connect hook run on each pooled connection after it is opened.
pub type PostConnectFn =
    Arc<dyn for<'c> Fn(&'c mut (dyn Connection + 'static)) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// Options for [`connect_pool`].
#[derive(Clone, Default)]
pub struct PoolOptions {
    /// Maximum number of outstanding connections; driver default when unset.
    pub max_size: Option<usize>,
    /// Maximum number of idle connections; requires `max_size`.
    pub max_idle_size: Option<usize>,
    /// Recycle a connection after this many acquisitions; 0 means the
    /// default of 100.
    pub max_use_count: u64,
    pub post_connect: Option<PostConnectFn>,
}

/// Build a connection pool for `uri`. The requested sizes are validated and
/// then clamped to the driver's capabilities.
pub async fn connect_pool(
    config: Config,
    uri: &str,
    options: PoolOptions,
) -> Result<Pool<Box<dyn Connection>>> {
    let driver = load_driver(uri)?;
    let info = driver.info();

    let (max_size, max_idle_size) =
        pool::resolve_sizes(options.max_size, options.max_idle_size, info.default_max_size)
            .map_err(|message| Error::ConnectFailed {
                uri: uri.to_string(),
                message: Msg::plain(message),
            })?;
    let (max_size, max_idle_size) = pool::gate_sizes(info, max_size, max_idle_size);
    let limits = PoolLimits {
        max_size,
        max_idle_size,
        max_use_count: if options.max_use_count == 0 {
            100
        } else {
            options.max_use_count
        },
    };

    let uri_owned = uri.to_string();
    let post_connect = options.post_connect.clone();
    let connect_hook: pool::ConnectFn<Box<dyn Connection>> = Box::new(move || {
        let config = config.clone();
        let uri = uri_owned.clone();
        let post_connect = post_connect.clone();
        Box::pin(async move {
            let mut conn = connect(config, &uri).await?;
            if let Some(post) = &post_connect {
                if let Err(e) = post(conn.as_mut()).await {
                    conn.disconnect().await;
                    return Err(e);
                }
            }
            Ok(conn)
        })
    });
    let disconnect_hook: pool::DisconnectFn<Box<dyn Connection>> =
        Box::new(|mut conn| Box::pin(async move { conn.disconnect().await }));
    let validate_hook: pool::ValidateFn<Box<dyn Connection>> =
        Box::new(|conn: &mut Box<dyn Connection>| conn.validate());
    let check_hook: pool::CheckFn<Box<dyn Connection>> =
        Box::new(|conn: &Box<dyn Connection>| conn.check());

    Ok(Pool::new(
        limits,
        connect_hook,
        disconnect_hook,
        validate_hook,
        check_hook,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Like `Result::unwrap_err`, without requiring `T: Debug`.
    fn unwrap_err<T>(result: Result<T>) -> Error {
        match result {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        }
    }

    struct FakeDriver(&'static DriverInfo);

    #[async_trait]
    impl Driver for FakeDriver {
        fn info(&self) -> &'static DriverInfo {
            self.0
        }

        async fn connect(&self, _config: &Config, uri: &str) -> Result<Box<dyn Connection>> {
            Err(Error::ConnectFailed {
                uri: uri.to_string(),
                message: Msg::plain("fake driver does not connect"),
            })
        }
    }

    #[test]
    fn test_missing_scheme_is_rejected() {
        let err = unwrap_err(load_driver("not-a-uri"));
        match err {
            Error::LoadRejected { message, .. } => assert_eq!(message, "Missing URI scheme."),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_builtin_schemes_resolve() {
        assert_eq!(load_driver("postgresql://h/d").unwrap().info().scheme, "postgresql");
        assert_eq!(load_driver("postgres://h/d").unwrap().info().scheme, "postgresql");
    }

    #[test]
    fn test_discovery_is_consulted_once_per_scheme() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        set_driver_discovery(|scheme| {
            if scheme == "discoverable-nothing" {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }
            None
        });
        assert!(load_driver("discoverable-nothing://h").is_err());
        assert!(load_driver("discoverable-nothing://h").is_err());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registered_driver_resolves() {
        static FAKE_INFO: DriverInfo = DriverInfo {
            scheme: "fakedb",
            can_concur: true,
            can_pool: true,
            default_max_size: 4,
        };
        register_driver("fakedb", Arc::new(FakeDriver(&FAKE_INFO)));
        assert_eq!(load_driver("fakedb://x").unwrap().info().scheme, "fakedb");
    }

    #[tokio::test]
    async fn test_pool_sizes_gated_by_capabilities() {
        static SERIAL_INFO: DriverInfo = DriverInfo {
            scheme: "serialdb",
            can_concur: false,
            can_pool: true,
            default_max_size: 4,
        };
        register_driver("serialdb", Arc::new(FakeDriver(&SERIAL_INFO)));

        let pool = connect_pool(
            Config::new(),
            "serialdb://h/d",
            PoolOptions {
                max_size: Some(5),
                max_idle_size: Some(0),
                ..PoolOptions::default()
            },
        )
        .await
        .unwrap();
        let limits = pool.limits();
        assert_eq!(limits.max_size, 1);
        assert_eq!(limits.max_idle_size, 0);
    }

    #[tokio::test]
    async fn test_pool_size_arguments_validated() {
        let err = unwrap_err(
            connect_pool(
                Config::new(),
                "postgresql://h/d",
                PoolOptions {
                    max_idle_size: Some(2),
                    ..PoolOptions::default()
                },
            )
            .await,
        );
        assert!(matches!(err, Error::ConnectFailed { .. }));
    }
}
