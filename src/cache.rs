//! Shared response cache backed by Redis.
//!
//! The client wraps two address-sharded pools (reads and writes) with
//! independent round-robin counters. Connections are established lazily and
//! reused through a reconnecting manager. Store errors never reach the
//! pipeline: a failed read is a miss, a failed write is logged and dropped.
//!
//! Stored values are the HTTP/1.1 wire representation of the full response
//! (status line, every header value including repeats, blank line, raw
//! body), parsed back on read.

use crate::config::RedisConfig;
use crate::error::Result;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Leading component of every cache key.
const KEY_PREFIX: &str = "sx";

/// Header slots available when decoding a stored response.
const MAX_HEADERS: usize = 128;

/// Largest response body admitted to the cache.
pub const MAX_CACHED_BODY: usize = 4 * 1024 * 1024;

/// A fully buffered HTTP response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Joins mode, path and extracted key values into a single cache key.
///
/// Keys are stable across restarts as long as the route definition and the
/// client request are unchanged.
pub fn make_key(mode: &str, path: &str, values: &[String]) -> String {
    let extra: usize = values.iter().map(|v| v.len() + 1).sum();
    let mut key = String::with_capacity(KEY_PREFIX.len() + mode.len() + path.len() + extra + 2);
    key.push_str(KEY_PREFIX);
    key.push(':');
    key.push_str(mode);
    key.push(':');
    key.push_str(path);
    for v in values {
        key.push(':');
        key.push_str(v);
    }
    key
}

/// Serializes a response into its wire representation.
pub fn encode_response(resp: &CachedResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(resp.body.len() + 256);
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            resp.status.as_u16(),
            resp.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&resp.body);
    buf
}

/// Parses a stored blob back into a response. Any malformation is a miss.
pub fn decode_response(blob: &[u8]) -> Option<CachedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let body_start = match parsed.parse(blob) {
        Ok(httparse::Status::Complete(n)) => n,
        _ => return None,
    };
    let status = StatusCode::from_u16(parsed.code?).ok()?;

    let mut map = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        map.append(name, value);
    }

    Some(CachedResponse {
        status,
        headers: map,
        body: Bytes::copy_from_slice(&blob[body_start..]),
    })
}

/// One store replica; the connection is established on first use and shared
/// afterwards.
struct Replica {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl Replica {
    fn new(addr: &str) -> Result<Self> {
        let target = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        Ok(Self {
            client: redis::Client::open(target)?,
            conn: OnceCell::new(),
        })
    }

    async fn manager(&self) -> redis::RedisResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }
}

/// Round-robin client over the configured read and write replicas.
pub struct CacheClient {
    readers: Vec<Replica>,
    writers: Vec<Replica>,
    read_idx: AtomicUsize,
    write_idx: AtomicUsize,
}

impl CacheClient {
    /// Builds a client from the configured addresses. No connections are
    /// opened here.
    pub fn new(conf: &RedisConfig) -> Result<Self> {
        Ok(Self {
            readers: conf
                .read_addresses
                .iter()
                .map(|a| Replica::new(a))
                .collect::<Result<_>>()?,
            writers: conf
                .write_addresses
                .iter()
                .map(|a| Replica::new(a))
                .collect::<Result<_>>()?,
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
        })
    }

    fn next_read(&self) -> Option<&Replica> {
        if self.readers.is_empty() {
            return None;
        }
        let idx = self.read_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        Some(&self.readers[idx])
    }

    fn next_write(&self) -> Option<&Replica> {
        if self.writers.is_empty() {
            return None;
        }
        let idx = self.write_idx.fetch_add(1, Ordering::Relaxed) % self.writers.len();
        Some(&self.writers[idx])
    }

    /// Fetches a previously stored response from a read replica.
    pub async fn get_response(&self, key: &str) -> Option<CachedResponse> {
        let replica = self.next_read()?;
        let mut conn = match replica.manager().await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "cache read connection failed");
                return None;
            }
        };
        let blob: Option<Vec<u8>> = match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "cache read failed");
                return None;
            }
        };
        decode_response(&blob?)
    }

    /// Stores a response with the given TTL. First writer wins: later writes
    /// for the same key within the TTL window are no-ops.
    pub async fn set_response(&self, key: &str, resp: &CachedResponse, ttl: Duration) {
        let Some(replica) = self.next_write() else {
            return;
        };
        let mut conn = match replica.manager().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cache write connection failed");
                return;
            }
        };
        let blob = encode_response(resp);
        let outcome: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(blob)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        if let Err(e) = outcome {
            warn!(error = %e, "cache write failed");
        }
    }

    /// Increments a fixed-window counter, arming the window TTL on the first
    /// hit. Returns `None` when the store is unreachable so callers can fail
    /// open.
    pub async fn incr_window(&self, key: &str, ttl: Duration) -> Option<i64> {
        let replica = self.next_write()?;
        let mut conn = match replica.manager().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "rate-limit connection failed");
                return None;
            }
        };
        let count: i64 = match redis::cmd("INCR").arg(key).query_async(&mut conn).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "rate-limit increment failed");
                return None;
            }
        };
        if count == 1 {
            let armed: redis::RedisResult<i64> = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await;
            if let Err(e) = armed {
                warn!(error = %e, "rate-limit window expiry failed");
            }
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_join() {
        assert_eq!(
            make_key("resp", "/a", &["v1".to_string(), "v2".to_string()]),
            "sx:resp:/a:v1:v2"
        );
        assert_eq!(make_key("resp", "/a", &[]), "sx:resp:/a");
        assert_eq!(
            make_key("rl:second", "/a", &["10.0.0.1".to_string()]),
            "sx:rl:second:/a:10.0.0.1"
        );
    }

    #[test]
    fn test_response_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let original = CachedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"hello\r\n\r\nworld \x00\x01"),
        };

        let decoded = decode_response(&encode_response(&original)).unwrap();

        assert_eq!(decoded.status, StatusCode::CREATED);
        assert_eq!(decoded.body, original.body);
        let cookies: Vec<_> = decoded.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(decoded.headers.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_roundtrip_empty_body_and_headers() {
        let original = CachedResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let decoded = decode_response(&encode_response(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_garbage_is_miss() {
        assert!(decode_response(b"not an http response").is_none());
        assert!(decode_response(b"HTTP/1.1 200 OK\r\ncontent-type").is_none());
        assert!(decode_response(b"").is_none());
    }

    #[test]
    fn test_client_construction_is_lazy() {
        let conf = RedisConfig {
            read_addresses: vec!["localhost:6379".to_string()],
            write_addresses: vec!["localhost:6380".to_string()],
        };
        // no store is running; construction must still succeed
        let client = CacheClient::new(&conf).unwrap();
        assert!(client.next_read().is_some());
        assert!(client.next_write().is_some());
    }
}
