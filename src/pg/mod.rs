//! PostgreSQL driver.
//!
//! Architecture:
//! - `protocol`: wire protocol message encoding/decoding
//! - `raw`: low-level client (handshake, result assembly, COPY)
//! - `types`: OID table and text-format value codecs
//! - `connection`: request dispatcher, statement cache, enum probing
//! - `scram`: SCRAM-SHA-256 authentication

pub mod protocol;
pub mod types;

mod connection;
mod error;
mod raw;
mod scram;


pub use connection::PgConnection;

use async_trait::async_trait;

use crate::config::Config;
use crate::driver::{Connection, Driver, DriverInfo};
use crate::error::Result;

static INFO: DriverInfo = DriverInfo {
    scheme: "postgresql",
    can_concur: true,
    can_pool: true,
    default_max_size: 8,
};

/// The PostgreSQL driver, registered for `postgresql://` and `postgres://`.
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    async fn connect(&self, config: &Config, uri: &str) -> Result<Box<dyn Connection>> {
        let conn = PgConnection::open(config, uri, &INFO).await?;
        Ok(Box::new(conn))
    }
}
