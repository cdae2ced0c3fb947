//! Memcached-backed counter store.
//!
//! Speaks the memcached text protocol over a small pool of lazily-dialed TCP
//! connections. A connection is owned by exactly one request while in use
//! and only goes back to the pool after a complete reply, so an error, a
//! timeout or a cancelled caller drops it instead of leaving a half-read
//! reply for the next request.
//!
//! Primitive mapping:
//! - increment with expiry: `incr`, then `add` on a miss (the expiry is only
//!   set by `add`, so increments never move it)
//! - get: `gets` (returns the CAS unique used as the version)
//! - compare-and-swap: `add` when the key was absent, `cas` otherwise
//! - set: `set`

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::{CounterStore, StoredValue};
use crate::error::StoreError;

/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;
/// Expiry values above this are read by memcached as absolute UNIX times.
const MAX_RELATIVE_EXPIRY_SECS: u64 = 60 * 60 * 24 * 30;
/// memcached parses the expiry field as a signed 32-bit integer.
const MAX_ABSOLUTE_EXPIRY: u64 = i32::MAX as u64;

/// Connection settings for [`MemcacheStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemcacheConfig {
    /// `host:port` of the memcached server
    #[serde(default = "default_address")]
    pub address: String,

    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds, including the wait for a free connection
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Connections kept open to the server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    250
}

fn default_io_timeout_ms() -> u64 {
    250
}

fn default_max_connections() -> usize {
    8
}

impl MemcacheConfig {
    /// Config for `address` with default timeouts.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// A parsed server reply.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// A single status line such as `STORED` or the result of `incr`
    Line(String),
    /// A `VALUE` block from `gets`
    Value { data: Vec<u8>, cas: u64 },
}

type Connection = BufStream<TcpStream>;

/// A [`CounterStore`] backed by a memcached server.
#[derive(Debug)]
pub struct MemcacheStore {
    config: MemcacheConfig,
    idle: Mutex<Vec<Connection>>,
    slots: Semaphore,
}

impl MemcacheStore {
    /// Create a store for `config`. No connection is made until first use.
    pub fn new(config: MemcacheConfig) -> Self {
        let slots = Semaphore::new(config.max_connections.max(1));
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            slots,
        }
    }

    /// The server address this store talks to.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Send one request and read one reply on a pooled connection.
    async fn exchange(&self, request: &[u8]) -> Result<Reply, StoreError> {
        let io_timeout = self.config.io_timeout();

        let _slot = tokio::time::timeout(io_timeout, self.slots.acquire())
            .await
            .map_err(|_| StoreError::Timeout(io_timeout))?
            .map_err(|_| StoreError::Protocol("connection pool closed".to_string()))?;

        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let result = tokio::time::timeout(io_timeout, round_trip(&mut conn, request))
            .await
            .unwrap_or(Err(StoreError::Timeout(io_timeout)));

        match result {
            Ok(reply) => {
                self.idle.lock().push(conn);
                Ok(reply)
            }
            Err(e) => {
                // The stream may hold half a reply; never reuse it
                warn!(address = %self.config.address, error = %e, "Dropping memcached connection");
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<Connection, StoreError> {
        let timeout = self.config.connect_timeout();
        debug!(address = %self.config.address, "Connecting to memcached");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.config.address))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        stream.set_nodelay(true)?;

        Ok(BufStream::new(stream))
    }

    async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>, StoreError> {
        let request = format!("incr {} {}\r\n", key, delta);
        match self.exchange(request.as_bytes()).await? {
            Reply::Line(line) if line == "NOT_FOUND" => Ok(None),
            Reply::Line(line) => parse_counter(line.as_bytes()).map(Some),
            reply => Err(unexpected(&reply)),
        }
    }

    async fn store(
        &self,
        verb: &str,
        key: &str,
        value: u64,
        ttl: Duration,
        cas: Option<u64>,
    ) -> Result<bool, StoreError> {
        let data = value.to_string();
        let mut request = format!("{} {} 0 {} {}", verb, key, expiry(ttl), data.len());
        if let Some(unique) = cas {
            request.push_str(&format!(" {}", unique));
        }
        request.push_str("\r\n");
        request.push_str(&data);
        request.push_str("\r\n");

        match self.exchange(request.as_bytes()).await? {
            Reply::Line(line) => match line.as_str() {
                "STORED" => Ok(true),
                "NOT_STORED" | "EXISTS" | "NOT_FOUND" => Ok(false),
                other => Err(StoreError::Protocol(format!("unexpected reply: {}", other))),
            },
            reply => Err(unexpected(&reply)),
        }
    }
}

#[async_trait]
impl CounterStore for MemcacheStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        validate_key(key)?;

        if let Some(value) = self.incr(key, delta).await? {
            return Ok(value);
        }

        if self.store("add", key, delta, ttl, None).await? {
            trace!(key = %key, "Created counter");
            return Ok(delta);
        }

        // Another client created the key between our incr and add
        self.incr(key, delta)
            .await?
            .ok_or_else(|| StoreError::Protocol(format!("counter {} vanished during create", key)))
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        validate_key(key)?;

        let request = format!("gets {}\r\n", key);
        match self.exchange(request.as_bytes()).await? {
            Reply::Value { data, cas } => Ok(Some(StoredValue {
                value: parse_counter(&data)?,
                version: cas,
            })),
            Reply::Line(line) if line == "END" => Ok(None),
            reply => Err(unexpected(&reply)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        current: Option<&StoredValue>,
        new: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        validate_key(key)?;

        match current {
            Some(observed) => self.store("cas", key, new, ttl, Some(observed.version)).await,
            None => self.store("add", key, new, ttl, None).await,
        }
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        validate_key(key)?;

        if self.store("set", key, value, ttl, None).await? {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("set of {} was not stored", key)))
        }
    }
}

async fn round_trip(conn: &mut Connection, request: &[u8]) -> Result<Reply, StoreError> {
    conn.write_all(request).await?;
    conn.flush().await?;
    read_reply(conn).await
}

async fn read_reply(conn: &mut Connection) -> Result<Reply, StoreError> {
    let line = read_line(conn).await?;

    if let Some(header) = line.strip_prefix("VALUE ") {
        // VALUE <key> <flags> <bytes> <cas unique>
        let fields: Vec<&str> = header.split(' ').collect();
        if fields.len() != 4 {
            return Err(StoreError::Protocol(format!("malformed VALUE line: {}", line)));
        }
        let len: usize = fields[2]
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bad value length: {}", fields[2])))?;
        let cas: u64 = fields[3]
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bad cas unique: {}", fields[3])))?;

        let mut data = vec![0u8; len + 2];
        conn.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(StoreError::Protocol("value block not terminated".to_string()));
        }
        data.truncate(len);

        let end = read_line(conn).await?;
        if end != "END" {
            return Err(StoreError::Protocol(format!("expected END, got {}", end)));
        }
        return Ok(Reply::Value { data, cas });
    }

    if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        return Err(StoreError::Protocol(line));
    }

    Ok(Reply::Line(line))
}

async fn read_line(conn: &mut Connection) -> Result<String, StoreError> {
    let mut line = String::new();
    let read = conn.read_line(&mut line).await?;
    if read == 0 {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "memcached closed the connection",
        )));
    }
    if !line.ends_with("\r\n") {
        return Err(StoreError::Protocol(format!("unterminated reply: {:?}", line)));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_counter(data: &[u8]) -> Result<u64, StoreError> {
    // memcached may pad decremented counters with trailing spaces
    let text = std::str::from_utf8(data)
        .map_err(|e| StoreError::Parse(e.to_string()))?
        .trim();
    text.parse()
        .map_err(|_| StoreError::Parse(format!("{:?}", text)))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "length {} outside 1..={}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StoreError::InvalidKey(format!("{:?} contains whitespace", key)));
    }
    Ok(())
}

/// Memcached expiry field for `ttl`: whole seconds, rounded up, at least one.
fn expiry(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    let secs = secs.max(1);

    if secs <= MAX_RELATIVE_EXPIRY_SECS {
        return secs;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_add(secs).min(MAX_ABSOLUTE_EXPIRY)
}

fn unexpected(reply: &Reply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake_memcached;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_increment_creates_then_increments() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::spawn().await));
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment_with_expiry("sg:fw:1:1:a", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.increment_with_expiry("sg:fw:1:1:a", 2, ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_and_compare_and_swap() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::spawn().await));
        let ttl = Duration::from_secs(5);

        assert!(store.get("tat").await.unwrap().is_none());
        assert!(store.compare_and_swap("tat", None, 100, ttl).await.unwrap());
        assert!(!store.compare_and_swap("tat", None, 200, ttl).await.unwrap());

        let observed = store.get("tat").await.unwrap().unwrap();
        assert_eq!(observed.value, 100);

        assert!(store.compare_and_swap("tat", Some(&observed), 150, ttl).await.unwrap());
        // The version moved on, so the stale observation loses
        assert!(!store.compare_and_swap("tat", Some(&observed), 175, ttl).await.unwrap());
        assert_eq!(store.get("tat").await.unwrap().unwrap().value, 150);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::spawn().await));
        let ttl = Duration::from_secs(5);

        store.increment_with_expiry("k", 9, ttl).await.unwrap();
        store.set("k", 0, ttl).await.unwrap();
        assert_eq!(store.increment_with_expiry("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::unreachable().await));

        let result = store
            .increment_with_expiry("k", 1, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(StoreError::Io(_)) | Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected_before_io() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::unreachable().await));

        let spaced = store.get("has space").await;
        assert!(matches!(spaced, Err(StoreError::InvalidKey(_))));

        let long = "k".repeat(MAX_KEY_LEN + 1);
        let result = store.set(&long, 1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_desync_next_reply() {
        let addr = fake_memcached::spawn_with_delay(Duration::from_millis(100)).await;
        let store = MemcacheStore::new(MemcacheConfig::new(addr));
        let ttl = Duration::from_secs(60);

        store.set("a", 100, ttl).await.unwrap();
        store.set("b", 1, ttl).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            store.increment_with_expiry("a", 1, ttl),
        )
        .await;
        assert!(abandoned.is_err());

        // The late reply for "a" must not be read as the answer for "b"
        assert_eq!(store.increment_with_expiry("b", 1, ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let store = MemcacheStore::new(MemcacheConfig::new(fake_memcached::spawn().await));
        let ttl = Duration::from_secs(60);

        for _ in 0..5 {
            store.increment_with_expiry("k", 1, ttl).await.unwrap();
        }
        assert_eq!(store.idle.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_for_a_connection_is_bounded() {
        let addr = fake_memcached::spawn_with_delay(Duration::from_millis(200)).await;
        let mut config = MemcacheConfig::new(addr);
        config.max_connections = 1;
        config.io_timeout_ms = 300;
        let store = Arc::new(MemcacheStore::new(config));

        let calls = (0..4).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store.increment_with_expiry(&format!("k{}", i), 1, Duration::from_secs(60)).await
            })
        });

        let started = std::time::Instant::now();
        let results: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // Queued callers give up after one io timeout instead of queueing behind each other
        assert!(started.elapsed() < Duration::from_millis(1200));
        assert!(results.iter().any(|r| r.is_ok()));
        assert!(results.iter().any(|r| matches!(r, Err(StoreError::Timeout(_)))));
    }

    #[test]
    fn test_expiry_rounding() {
        assert_eq!(expiry(Duration::ZERO), 1);
        assert_eq!(expiry(Duration::from_millis(1)), 1);
        assert_eq!(expiry(Duration::from_millis(1500)), 2);
        assert_eq!(expiry(Duration::from_secs(60)), 60);
        // Beyond thirty days memcached wants an absolute timestamp
        assert!(expiry(Duration::from_secs(MAX_RELATIVE_EXPIRY_SECS + 1)) > 1_000_000_000);
        assert_eq!(expiry(Duration::MAX), MAX_ABSOLUTE_EXPIRY);
    }

    #[test]
    fn test_parse_counter_trims_padding() {
        assert_eq!(parse_counter(b"42  ").unwrap(), 42);
        assert!(matches!(parse_counter(b"abc"), Err(StoreError::Parse(_))));
    }
}
