//! Database layer for the TDEI backend worker.
//!
//! Provides an async bounded connection pool, the Postgres connector built on
//! it, SQLSTATE-to-kind error translation, and the [`DbProvider`]/[`DbSession`]
//! capability traits the job pipeline is written against.

mod async_pool;
mod error;
mod postgres;
mod session;

pub use async_pool::{AcquireError, AsyncPool, AsyncPooled, CancelToken, PoolStats};
pub use error::{DbError, DbErrorKind};
pub use postgres::{PgConn, PgPool, PgPoolConfig, row_to_json};
pub use session::{DbProvider, DbSession, JsonRow, SqlValue};
pub use tokio_postgres::config::{Config as PgConfig, SslMode};
