//! The request pipeline and the gateway's swappable policy state.
//!
//! Each request runs the staged pipeline: match, authorize, method check,
//! backend select, rate limit, cache lookup, serve-or-proxy, post-response
//! store, observe. The mutable state is a single [`Bundle`] behind an
//! `RwLock<Arc<_>>`: requests snapshot the `Arc` once at entry and never
//! observe a half-replaced configuration; [`Gateway::load_config`] builds a
//! complete new bundle before publishing it.

use crate::backend::{BackendGroup, ProxyBody};
use crate::cache::{self, CacheClient, CachedResponse, MAX_CACHED_BODY};
use crate::config::{Auth, AuthBasic, CacheKey, GatewayConfig};
use crate::error::{
    ClientError, ProxyError, Result, ERROR_BAD_GATEWAY, ERROR_BAD_METHOD, ERROR_FORBIDDEN,
    ERROR_NOT_FOUND, ERROR_TOO_MANY_REQUESTS,
};
use crate::metrics::{Metrics, RouteLabels};
use crate::ratelimit;
use crate::route::{RouteTable, RouteTarget};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tracing::{debug, info, warn};

/// Everything a request needs to be served: the compiled match table, the
/// per-service backend groups and the cache client. Replaced wholesale on
/// reload.
#[derive(Default)]
struct Bundle {
    table: RouteTable,
    backends: HashMap<String, BackendGroup>,
    cache: Option<CacheClient>,
}

/// Per-request state captured at pipeline entry and carried to the
/// post-response step.
struct RequestContext {
    target: Arc<RouteTarget>,
    labels: RouteLabels,
    original_path: String,
    cache_key: Option<String>,
    start: Instant,
}

/// The gateway: policy state plus the pipeline that applies it.
pub struct Gateway {
    state: RwLock<Arc<Bundle>>,
    follow_redirects: bool,
}

impl Gateway {
    /// Creates a gateway with no routes; requests 404 until a configuration
    /// is loaded.
    pub fn new(follow_redirects: bool) -> Self {
        Self {
            state: RwLock::new(Arc::new(Bundle::default())),
            follow_redirects,
        }
    }

    /// Compiles and installs a new configuration.
    ///
    /// The whole replacement state (routes, backends, cache client) is built
    /// before publication, and published as one pointer swap: new requests
    /// see either the old bundle or the new one, never a mix. In-flight
    /// requests finish against the snapshot they captured.
    ///
    /// # Errors
    ///
    /// Returns an error without touching the installed state if any part of
    /// the new configuration fails to compile.
    pub fn load_config(&self, conf: &GatewayConfig) -> Result<()> {
        let table = RouteTable::compile(conf)?;

        let mut backends = HashMap::with_capacity(conf.services.len());
        for svc in &conf.services {
            let group =
                BackendGroup::new(&svc.addresses, self.follow_redirects).map_err(|e| {
                    ProxyError::InvalidConfig(format!("in service {:?}: {e}", svc.name))
                })?;
            backends.insert(svc.name.clone(), group);
        }

        let cache = if conf.redis.configured() {
            Some(CacheClient::new(&conf.redis)?)
        } else {
            None
        };

        let bundle = Arc::new(Bundle {
            table,
            backends,
            cache,
        });
        info!(
            services = conf.services.len(),
            routes = bundle.table.len(),
            "configuration loaded"
        );
        *self.state.write() = bundle;
        Ok(())
    }

    fn snapshot(&self) -> Arc<Bundle> {
        self.state.read().clone()
    }

    /// Runs one request through the pipeline.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let bundle = self.snapshot();
        let path = req.uri().path().to_string();

        let Some(route) = bundle.table.match_path(&path) else {
            return error_response(&ERROR_NOT_FOUND);
        };
        let target = Arc::clone(&route.target);

        if !authorize(target.auth.as_deref(), req.headers()) {
            return error_response(&ERROR_FORBIDDEN);
        }

        if !target.method.is_empty() && req.method().as_str() != target.method {
            return error_response(&ERROR_BAD_METHOD);
        }

        let Some(backend) = bundle.backends.get(&target.service).and_then(|g| g.next()) else {
            return error_response(&ERROR_BAD_GATEWAY);
        };

        let mut ctx = RequestContext {
            labels: RouteLabels {
                service: target.service.clone(),
                route: target.route.clone(),
                path: target.absolute_path.clone(),
                method: req.method().as_str().to_string(),
            },
            target,
            original_path: path,
            cache_key: None,
            start: Instant::now(),
        };

        if let (Some(policy), Some(cache)) =
            (ctx.target.rate_limit.as_deref(), bundle.cache.as_ref())
        {
            let values = extract_values(&policy.keys, &req);
            if !ratelimit::check(cache, policy, &ctx.original_path, &values).await {
                return error_response(&ERROR_TOO_MANY_REQUESTS);
            }
        }

        if let (Some(policy), Some(cache)) = (ctx.target.cache.as_deref(), bundle.cache.as_ref())
        {
            let values = extract_values(&policy.keys, &req);
            let key = cache::make_key("resp", &ctx.original_path, &values);

            let fetch_start = Instant::now();
            let cached = cache.get_response(&key).await;
            Metrics::record_cache_get(&ctx.labels, fetch_start.elapsed().as_secs_f64());

            if let Some(cached) = cached {
                Metrics::record_cache_hit(&ctx.labels);
                debug!(method = %ctx.labels.method, path = %ctx.original_path, "served from cache");
                let status = cached.status.as_u16();
                let response = replay_cached(cached);
                Metrics::record_request(&ctx.labels, status, ctx.start.elapsed().as_secs_f64());
                return response;
            }
            ctx.cache_key = Some(key);
        }

        let upstream = backend.authority.clone();
        let Some(req) = rewrite_request(req, &ctx.target.path_prefix, &upstream) else {
            return error_response(&ERROR_BAD_GATEWAY);
        };
        debug!(
            method = %ctx.labels.method,
            path = %ctx.original_path,
            upstream = %upstream,
            "forwarding to upstream"
        );

        let response = match backend.request(req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(upstream = %upstream, error = %e, "upstream request failed");
                let response = error_response(&ERROR_BAD_GATEWAY);
                Metrics::record_request(&ctx.labels, 502, ctx.start.elapsed().as_secs_f64());
                return response;
            }
        };

        let response = self.post_response(&ctx, bundle.cache.as_ref(), response).await;
        Metrics::record_request(
            &ctx.labels,
            response.status().as_u16(),
            ctx.start.elapsed().as_secs_f64(),
        );
        response
    }

    /// Stores a cacheable upstream response, replaying the buffered body to
    /// the client. Responses outside the cacheable set stream through
    /// untouched.
    async fn post_response(
        &self,
        ctx: &RequestContext,
        cache: Option<&CacheClient>,
        response: Response<Incoming>,
    ) -> Response<ProxyBody> {
        let (Some(key), Some(policy), Some(cache)) =
            (ctx.cache_key.as_deref(), ctx.target.cache.as_deref(), cache)
        else {
            return response.map(|b| b.boxed());
        };
        if response.status().as_u16() >= 400 {
            return response.map(|b| b.boxed());
        }

        let (parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "error buffering upstream response");
                return error_response(&ERROR_BAD_GATEWAY);
            }
        };

        if body.len() <= MAX_CACHED_BODY {
            let cached = CachedResponse {
                status: parts.status,
                headers: parts.headers.clone(),
                body: body.clone(),
            };
            let store_start = Instant::now();
            cache.set_response(key, &cached, policy.ttl).await;
            Metrics::record_cache_set(&ctx.labels, store_start.elapsed().as_secs_f64());
        } else {
            debug!(bytes = body.len(), "response too large to cache");
        }

        Response::from_parts(parts, full_body(body))
    }
}

/// Evaluates the route's auth policy against the request credentials. Basic
/// wins when both variants are declared.
fn authorize(auth: Option<&Auth>, headers: &HeaderMap) -> bool {
    let Some(auth) = auth else { return true };
    if let Some(basic) = &auth.basic {
        return check_basic(basic, headers);
    }
    if let Some(bearer) = &auth.bearer {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
            .unwrap_or("");
        return bearer.verifier.verify(token).is_ok();
    }
    true
}

fn check_basic(basic: &AuthBasic, headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((username, password)) => basic.verify(username, password),
        None => false,
    }
}

/// Produces the fingerprint values for a key list, in declaration order.
/// Absent sources yield empty strings so key shapes stay stable.
fn extract_values<B>(keys: &[CacheKey], req: &Request<B>) -> Vec<String> {
    keys.iter()
        .map(|key| match key {
            CacheKey::Header(name) => req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            CacheKey::Query(name) => req
                .uri()
                .query()
                .and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k.as_ref() == name.as_str())
                        .map(|(_, v)| v.into_owned())
                })
                .unwrap_or_default(),
        })
        .collect()
}

/// Rewrites the request target for the selected upstream: strips the service
/// prefix, forces cleartext and points the Host header at the upstream.
/// Everything else passes through.
fn rewrite_request<B>(
    req: Request<B>,
    path_prefix: &str,
    authority: &str,
) -> Option<Request<ProxyBody>>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (mut parts, body) = req.into_parts();

    let stripped = parts
        .uri
        .path()
        .strip_prefix(path_prefix)
        .unwrap_or(parts.uri.path());
    let path = if stripped.is_empty() { "/" } else { stripped };
    let path_and_query = match parts.uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    // whether the upstream supports TLS is unknown, so it is always spoken
    // to in cleartext
    parts.uri = Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()?;
    parts
        .headers
        .insert(HOST, HeaderValue::from_str(authority).ok()?);

    Some(Request::from_parts(parts, body.boxed()))
}

/// Re-emits a cached response: all header values, then status, then body.
fn replay_cached(cached: CachedResponse) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(cached.body));
    *response.headers_mut() = cached.headers;
    *response.status_mut() = cached.status;
    response
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Builds the JSON error envelope for a client-facing routing error.
pub fn error_response(err: &ClientError) -> Response<ProxyBody> {
    let mut body = serde_json::to_vec(err).unwrap_or_default();
    body.push(b'\n');
    Response::builder()
        .status(StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

/// Tower service adapter over a shared [`Gateway`].
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        Box::pin(async move { Ok(gateway.handle(req).await) })
    }
}
