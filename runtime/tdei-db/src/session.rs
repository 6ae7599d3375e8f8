use std::error::Error;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::types::{IsNull, ToSql, Type};

use crate::DbError;

/// One decoded result row, keyed by column name.
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Bind parameter for the fixed planning and metadata statements.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Text(String),
    Float(f64),
    Int(i64),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Self::Text(value) => value.to_sql(ty, out),
            Self::Float(value) => value.to_sql(ty, out),
            Self::Int(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
            || <f64 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Self::Text(value) => value.to_sql_checked(ty, out),
            Self::Float(value) => value.to_sql_checked(ty, out),
            Self::Int(value) => value.to_sql_checked(ty, out),
        }
    }
}

/// An exclusively owned database connection.
///
/// Dropping the session releases the underlying connection back to its pool.
#[async_trait]
pub trait DbSession: Send {
    /// Runs one or more statements without parameters or results
    /// (`BEGIN`, `COMMIT`, `CLOSE ...`, `DECLARE ...`).
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Runs a statement and decodes every result row.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<JsonRow>, DbError>;
}

/// Source of [`DbSession`]s, injected into the job orchestrator.
#[async_trait]
pub trait DbProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn DbSession>, DbError>;
}
