//! Upstream backend groups: URL parsing, per-backend proxy transport and
//! round-robin selection.

use crate::error::{ProxyError, Result};
use http::header::{HOST, LOCATION};
use http::{Method, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Maximum redirect hops followed in fast mode.
const MAX_REDIRECT_HOPS: usize = 50;

/// Body type used on the upstream path.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// One upstream: its authority and the client transport that owns its
/// connection pool.
pub struct Backend {
    pub authority: String,
    client: Client<HttpConnector, ProxyBody>,
    follow_redirects: bool,
}

impl Backend {
    fn new(addr: &str, follow_redirects: bool) -> Result<Self> {
        let authority = parse_authority(addr)?;
        // The workload is many concurrent upstream connections to a handful
        // of hosts, so the idle pool is sized well above hyper's default.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(idle_pool_size())
            .build_http();
        Ok(Self {
            authority,
            client,
            follow_redirects,
        })
    }

    /// Sends a rewritten request to this upstream.
    ///
    /// Redirects are not followed on the default path; in fast mode GET
    /// requests are re-issued for up to [`MAX_REDIRECT_HOPS`] hops, always
    /// over cleartext.
    pub async fn request(
        &self,
        req: Request<ProxyBody>,
    ) -> std::result::Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let method = req.method().clone();
        let mut current = req.uri().clone();
        let mut res = self.client.request(req).await?;

        if self.follow_redirects && method == Method::GET {
            let mut hops = 0;
            while res.status().is_redirection() && hops < MAX_REDIRECT_HOPS {
                let location = res
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|l| resolve_location(&current, l));
                let Some(next) = location else { break };

                let Some(host) = next.authority().map(|a| a.to_string()) else {
                    break;
                };
                debug!(location = %next, "following upstream redirect");
                let redirect = match Request::builder()
                    .method(Method::GET)
                    .uri(next.clone())
                    .header(HOST, host)
                    .body(empty_body())
                {
                    Ok(r) => r,
                    Err(_) => break,
                };
                res = self.client.request(redirect).await?;
                current = next;
                hops += 1;
            }
        }

        Ok(res)
    }
}

/// The set of upstreams for one service, iterated round-robin.
pub struct BackendGroup {
    backends: Vec<Backend>,
    next: AtomicUsize,
}

impl BackendGroup {
    /// Parses the upstream addresses and builds one transport per backend.
    pub fn new(addresses: &[String], follow_redirects: bool) -> Result<Self> {
        let backends = addresses
            .iter()
            .map(|a| Backend::new(a, follow_redirects))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            backends,
            next: AtomicUsize::new(0),
        })
    }

    /// Returns the next backend; fair over time under concurrent callers.
    pub fn next(&self) -> Option<&Backend> {
        if self.backends.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Some(&self.backends[idx])
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Creates an empty request body for the proxy client.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn idle_pool_size() -> usize {
    1000 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Accepts `scheme://host[:port]` or bare `host:port`; the latter is treated
/// as `http://host:port`. Only the authority is retained since upstream
/// traffic is always cleartext.
fn parse_authority(addr: &str) -> Result<String> {
    let with_scheme = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let uri: Uri = with_scheme.parse().map_err(|e: http::uri::InvalidUri| {
        ProxyError::UpstreamAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
    })?;
    match uri.authority() {
        Some(a) => Ok(a.to_string()),
        None => Err(ProxyError::UpstreamAddress {
            addr: addr.to_string(),
            reason: "missing host".to_string(),
        }),
    }
}

/// Resolves a `Location` header against the current request target, forcing
/// cleartext for absolute targets.
fn resolve_location(current: &Uri, location: &str) -> Option<Uri> {
    if location.contains("://") {
        let target: Uri = location.parse().ok()?;
        let authority = target.authority()?.clone();
        let path_and_query = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        return Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .ok();
    }
    if location.starts_with('/') {
        return Uri::builder()
            .scheme("http")
            .authority(current.authority()?.clone())
            .path_and_query(location)
            .build()
            .ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_authority_forms() {
        assert_eq!(parse_authority("127.0.0.1:8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(
            parse_authority("http://127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080"
        );
        assert_eq!(
            parse_authority("https://upstream.internal").unwrap(),
            "upstream.internal"
        );
        assert_eq!(
            parse_authority("http://upstream.internal:9000/ignored").unwrap(),
            "upstream.internal:9000"
        );
        assert!(parse_authority("http://").is_err());
        assert!(parse_authority("not a url").is_err());
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let addresses: Vec<String> = vec![
            "127.0.0.1:8081".to_string(),
            "127.0.0.1:8082".to_string(),
            "127.0.0.1:8083".to_string(),
        ];
        let group = BackendGroup::new(&addresses, false).unwrap();

        let k = 4;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..k * addresses.len() {
            let backend = group.next().unwrap();
            *counts.entry(backend.authority.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), addresses.len());
        for addr in &addresses {
            assert_eq!(counts[addr], k, "backend {addr} not selected {k} times");
        }
    }

    #[tokio::test]
    async fn test_empty_group_yields_none() {
        let group = BackendGroup::new(&[], false).unwrap();
        assert!(group.next().is_none());
        assert!(group.is_empty());
    }

    #[test]
    fn test_resolve_location() {
        let current: Uri = "http://10.0.0.1:8080/a/b".parse().unwrap();

        let relative = resolve_location(&current, "/c?x=1").unwrap();
        assert_eq!(relative.to_string(), "http://10.0.0.1:8080/c?x=1");

        let absolute = resolve_location(&current, "https://10.0.0.2:9090/d").unwrap();
        assert_eq!(absolute.to_string(), "http://10.0.0.2:9090/d");

        assert!(resolve_location(&current, "not-a-target").is_none());
    }
}
