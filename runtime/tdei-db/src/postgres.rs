//! Async Postgres connector backing the [`DbProvider`] capability.

use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info};

use crate::{
    AcquireError, AsyncPool, AsyncPooled, CancelToken, DbError, DbProvider, DbSession, JsonRow,
    PoolStats, SqlValue,
};

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub pg: Config,
    pub max_conns: usize,
    pub max_idle: Option<Duration>,
    pub connect_timeout: Duration,
    pub max_wait: Duration,
    pub health_check_interval: Option<Duration>,
    pub ssl_root_cert: Option<PathBuf>,
}

impl PgPoolConfig {
    pub fn new(pg: Config) -> Self {
        Self {
            pg,
            max_conns: 4,
            max_idle: Some(Duration::from_secs(300)),
            connect_timeout: Duration::from_secs(10),
            max_wait: Duration::from_secs(60),
            health_check_interval: Some(Duration::from_secs(30)),
            ssl_root_cert: None,
        }
    }

    pub fn from_dsn(dsn: &str) -> Result<Self, DbError> {
        let pg = dsn
            .parse::<Config>()
            .map_err(|err| DbError::generic(format!("invalid Postgres DSN: {err}")))?;
        Ok(Self::new(pg))
    }
}

pub struct PgConn {
    client: Client,
    last_used: Mutex<Instant>,
}

impl PgConn {
    async fn connect(config: &PgPoolConfig) -> Result<Self, String> {
        let mut pg_config = config.pg.clone();
        pg_config.connect_timeout(config.connect_timeout);
        let client = if pg_config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = pg_config
                .connect(NoTls)
                .await
                .map_err(|err| err.to_string())?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection closed with error");
                }
            });
            client
        } else {
            let tls = build_tls_connector(config)?;
            let (client, connection) = pg_config
                .connect(tls)
                .await
                .map_err(|err| err.to_string())?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection closed with error");
                }
            });
            client
        };
        info!("database connected");
        Ok(Self {
            client,
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub async fn ping(&self) -> Result<(), tokio_postgres::Error> {
        self.client.simple_query("SELECT 1").await.map(|_| ())
    }
}

pub struct PgPool {
    config: Arc<PgPoolConfig>,
    pool: Arc<AsyncPool<PgConn>>,
    cancel: CancelToken,
}

impl PgPool {
    pub fn new(config: PgPoolConfig) -> Self {
        let config = Arc::new(config);
        let pool = {
            let cfg = Arc::clone(&config);
            AsyncPool::new(config.max_conns, move || {
                let cfg = Arc::clone(&cfg);
                async move { PgConn::connect(&cfg).await }
            })
        };
        Self {
            config,
            pool,
            cancel: CancelToken::new(),
        }
    }

    /// Stops handing out connections; pending acquires fail with `Cancelled`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn checkout(&self) -> Result<AsyncPooled<PgConn>, AcquireError> {
        debug!(stats = ?self.stats(), "acquiring database connection");
        loop {
            let conn = self
                .pool
                .acquire(Some(self.config.max_wait), Some(&self.cancel))
                .await?;
            if let Some(max_idle) = self.config.max_idle {
                if conn.as_ref().idle_for() > max_idle {
                    conn.discard();
                    continue;
                }
            }
            if let Some(interval) = self.config.health_check_interval {
                if conn.as_ref().idle_for() > interval && conn.as_ref().ping().await.is_err() {
                    conn.discard();
                    continue;
                }
            }
            conn.as_ref().touch();
            debug!(stats = ?self.stats(), "database connection acquired");
            return Ok(conn);
        }
    }

    pub fn config(&self) -> &PgPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl DbProvider for PgPool {
    async fn acquire(&self) -> Result<Box<dyn DbSession>, DbError> {
        let conn = self
            .checkout()
            .await
            .map_err(|err| DbError::generic(err.to_string()))?;
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: AsyncPooled<PgConn>,
}

#[async_trait]
impl DbSession for PgSession {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.as_ref().touch();
        self.conn.as_ref().client().batch_execute(sql).await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<JsonRow>, DbError> {
        self.conn.as_ref().touch();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param as &(dyn ToSql + Sync))
            .collect();
        let rows = self.conn.as_ref().client().query(sql, &refs).await?;
        rows.iter().map(row_to_json).collect()
    }
}

/// Decodes a row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> Result<JsonRow, DbError> {
    let mut out = JsonRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match row.try_get::<_, Option<RawValue<'_>>>(idx)? {
            Some(RawValue(raw)) => decode_value(column.type_(), raw).map_err(|err| {
                DbError::generic(format!("cannot decode column {}: {err}", column.name()))
            })?,
            None => Value::Null,
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

type DecodeError = Box<dyn Error + Sync + Send>;

/// A column value of any type, as its binary wire bytes.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(Self(raw))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Decodes one non-null binary column value. Types with no JSON mapping
/// (geometry, timestamps, ranges, ...) decode to null.
pub fn decode_value(ty: &Type, raw: &[u8]) -> Result<Value, DecodeError> {
    let value = if <Value as FromSql<'_>>::accepts(ty) {
        Value::from_sql(ty, raw)?
    } else if <String as FromSql<'_>>::accepts(ty) {
        Value::String(String::from_sql(ty, raw)?)
    } else if *ty == Type::BOOL {
        Value::Bool(bool::from_sql(ty, raw)?)
    } else if *ty == Type::INT2 {
        Value::from(i16::from_sql(ty, raw)?)
    } else if *ty == Type::INT4 {
        Value::from(i32::from_sql(ty, raw)?)
    } else if *ty == Type::INT8 {
        Value::from(i64::from_sql(ty, raw)?)
    } else if *ty == Type::OID {
        Value::from(u32::from_sql(ty, raw)?)
    } else if *ty == Type::FLOAT4 {
        Value::from(f64::from(f32::from_sql(ty, raw)?))
    } else if *ty == Type::FLOAT8 {
        Value::from(f64::from_sql(ty, raw)?)
    } else if *ty == Type::NUMERIC {
        decode_numeric(raw)?
    } else if *ty == Type::UUID {
        Value::String(decode_uuid(raw)?)
    } else if <Vec<String> as FromSql<'_>>::accepts(ty) {
        Value::from(Vec::<String>::from_sql(ty, raw)?)
    } else {
        debug!(column_type = %ty, "no JSON mapping for column type, decoding as null");
        Value::Null
    };
    Ok(value)
}

/// Binary `numeric`: digit count, weight, sign and display scale, then
/// base-10000 digits. NaN and infinities decode to null.
fn decode_numeric(raw: &[u8]) -> Result<Value, DecodeError> {
    let word = |at: usize| {
        raw.get(at..at + 2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
            .ok_or_else(|| DecodeError::from("truncated numeric value"))
    };
    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    let scale = word(6)?;
    if sign != 0x0000 && sign != 0x4000 {
        return Ok(Value::Null);
    }
    let mut value = 0f64;
    for (i, exponent) in (0..ndigits).zip((i32::MIN..=weight).rev()) {
        value += f64::from(word(8 + 2 * i)?) * 10_000f64.powi(exponent);
    }
    if sign == 0x4000 {
        value = -value;
    }
    if scale == 0 && value.abs() < 9.0e15 {
        return Ok(Value::from(value as i64));
    }
    Ok(Value::from(value))
}

fn decode_uuid(raw: &[u8]) -> Result<String, DecodeError> {
    if raw.len() != 16 {
        return Err(DecodeError::from("uuid value must be 16 bytes"));
    }
    let hex: String = raw.iter().map(|byte| format!("{byte:02x}")).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    ))
}

fn build_tls_connector(config: &PgPoolConfig) -> Result<MakeRustlsConnect, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!(error = %err, "skipping unreadable native certificate");
    }
    for cert in native.certs {
        roots.add(cert).map_err(|err| err.to_string())?;
    }
    if let Some(path) = config.ssl_root_cert.as_ref() {
        let pem = std::fs::read(path).map_err(|err| format!("{}: {err}", path.display()))?;
        let mut reader = std::io::Cursor::new(pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert.map_err(|err| err.to_string())?)
                .map_err(|err| err.to_string())?;
        }
    }
    if roots.is_empty() {
        return Err("no root certificates available for TLS".to_string());
    }
    let tls_config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|err| err.to_string())?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_postgres::types::Kind;

    use super::*;

    #[test]
    fn every_column_type_is_accepted_as_raw_bytes() {
        for ty in [Type::TIMESTAMPTZ, Type::NUMERIC, Type::UUID, Type::BYTEA, Type::INTERVAL] {
            assert!(<RawValue<'_> as FromSql<'_>>::accepts(&ty), "{ty}");
        }
    }

    #[test]
    fn known_types_decode_to_json() {
        assert_eq!(decode_value(&Type::INT4, &42i32.to_be_bytes()).expect("int4"), json!(42));
        assert_eq!(decode_value(&Type::VARCHAR, b"footway").expect("varchar"), json!("footway"));
        assert_eq!(decode_value(&Type::BOOL, &[1]).expect("bool"), json!(true));
        let mut jsonb = vec![1u8];
        jsonb.extend_from_slice(br#"{"highway":"footway"}"#);
        assert_eq!(
            decode_value(&Type::JSONB, &jsonb).expect("jsonb"),
            json!({"highway": "footway"})
        );
    }

    #[test]
    fn numeric_and_uuid_decode_from_binary() {
        // 12.5: two digits, weight 0, scale 1, digits [12, 5000]
        let twelve_and_a_half = [0, 2, 0, 0, 0, 0, 0, 1, 0, 12, 0x13, 0x88];
        assert_eq!(decode_value(&Type::NUMERIC, &twelve_and_a_half).expect("numeric"), json!(12.5));
        // -20000: one digit, weight 1, negative, scale 0
        let minus_twenty_thousand = [0, 1, 0, 1, 0x40, 0, 0, 0, 0, 2];
        assert_eq!(
            decode_value(&Type::NUMERIC, &minus_twenty_thousand).expect("numeric"),
            json!(-20000)
        );
        let nan = [0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert_eq!(decode_value(&Type::NUMERIC, &nan).expect("nan"), Value::Null);
        assert!(decode_value(&Type::NUMERIC, &[0, 1]).is_err());

        let uuid: Vec<u8> = (0u8..16).collect();
        assert_eq!(
            decode_value(&Type::UUID, &uuid).expect("uuid"),
            json!("00010203-0405-0607-0809-0a0b0c0d0e0f")
        );
    }

    #[test]
    fn unmapped_types_decode_to_null() {
        let geometry = Type::new("geometry".into(), 17_893, Kind::Simple, "public".into());
        assert_eq!(decode_value(&geometry, &[1, 1, 0, 0, 0]).expect("geometry"), Value::Null);
        assert_eq!(
            decode_value(&Type::TIMESTAMPTZ, &0i64.to_be_bytes()).expect("timestamptz"),
            Value::Null
        );
    }

    #[test]
    fn dsn_parses_into_pool_config() {
        let config = PgPoolConfig::from_dsn("host=db.internal port=6543 user=tdei dbname=content")
            .expect("dsn");
        assert_eq!(config.pg.get_user(), Some("tdei"));
        assert_eq!(config.pg.get_dbname(), Some("content"));
        assert_eq!(config.pg.get_ports(), &[6543]);
    }

    #[test]
    fn malformed_dsn_is_rejected() {
        let err = PgPoolConfig::from_dsn("host=localhost port=not-a-port")
            .err()
            .expect("error");
        assert!(err.message.contains("invalid Postgres DSN"));
    }
}
