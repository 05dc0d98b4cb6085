//! Gateway configuration: strict YAML decoding, normalization, validation
//! and policy inheritance.
//!
//! Parsing is strict: unknown fields anywhere in the file are rejected, so a
//! typo never silently disables a policy. After decoding, every string field
//! is trimmed, each service derives its path prefix, and a single walk over
//! each route-group tree resolves inherited policy: a child's missing
//! `auth`/`cache`/`ratelimit` block adopts the parent's by reference
//! (`Arc`-shared, never merged field-wise), while an explicit block always
//! wins.

use crate::error::{ProxyError, Result};
use crate::jwt::JwtVerifier;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// File-level schema mirroring the YAML document. Kept separate from the
/// public model so back-references and derived fields never appear in the
/// serde layer.
mod schema {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct GatewayConfigFile {
        #[serde(default)]
        pub redis: RedisFile,
        #[serde(default)]
        pub services: Vec<ServiceFile>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct RedisFile {
        #[serde(default)]
        pub readaddresses: Vec<String>,
        #[serde(default)]
        pub writeaddresses: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct ServiceFile {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub addresses: Vec<String>,
        #[serde(default)]
        pub routes: Vec<RouteGroupFile>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct RouteGroupFile {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub method: String,
        #[serde(default)]
        pub path: String,
        pub auth: Option<AuthFile>,
        pub cache: Option<CacheFile>,
        pub ratelimit: Option<RateLimitFile>,
        pub routes: Option<Vec<RouteGroupFile>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct AuthFile {
        pub basic: Option<AuthBasicFile>,
        pub bearer: Option<AuthBearerFile>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct AuthBasicFile {
        #[serde(default)]
        pub username: String,
        #[serde(default)]
        pub password: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct AuthBearerFile {
        #[serde(default)]
        pub publickey: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct CacheFile {
        pub ttl: Option<String>,
        #[serde(default)]
        pub keys: Vec<CacheKeyFile>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct CacheKeyFile {
        pub header: Option<String>,
        pub query: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct RateLimitFile {
        pub day: Option<u64>,
        pub hour: Option<u64>,
        pub minute: Option<u64>,
        pub second: Option<u64>,
        #[serde(default)]
        pub keys: Vec<CacheKeyFile>,
    }
}

/// Root of the gateway configuration. Immutable once built.
#[derive(Debug)]
pub struct GatewayConfig {
    pub redis: RedisConfig,
    pub services: Vec<Service>,
}

/// Cache-store connection addresses, sharded into read and write pools.
#[derive(Debug, Clone, Default)]
pub struct RedisConfig {
    pub read_addresses: Vec<String>,
    pub write_addresses: Vec<String>,
}

impl RedisConfig {
    /// The store is configured iff both a read and a write address exist.
    pub fn configured(&self) -> bool {
        !self.read_addresses.is_empty() && !self.write_addresses.is_empty()
    }

    fn resolve(file: schema::RedisFile) -> Self {
        Self {
            read_addresses: clean_addresses(file.readaddresses),
            write_addresses: clean_addresses(file.writeaddresses),
        }
    }
}

/// A named group of upstream backends mounted at `/<name>`.
#[derive(Debug)]
pub struct Service {
    pub name: String,
    pub path_prefix: String,
    pub addresses: Vec<String>,
    pub routes: Vec<RouteGroup>,
}

/// A node in the per-service policy tree. A node with an empty `path` is a
/// policy container only, not an endpoint; an empty `method` matches any
/// method.
#[derive(Debug)]
pub struct RouteGroup {
    pub name: String,
    pub method: String,
    pub path: String,
    pub auth: Option<Arc<Auth>>,
    pub cache: Option<Arc<Cache>>,
    pub rate_limit: Option<Arc<RateLimit>>,
    pub routes: Vec<RouteGroup>,
}

/// Authentication policy. When both variants are declared, Basic wins.
#[derive(Debug)]
pub struct Auth {
    pub basic: Option<AuthBasic>,
    pub bearer: Option<AuthBearer>,
}

#[derive(Debug, Clone)]
pub struct AuthBasic {
    pub username: String,
    pub password: String,
}

impl AuthBasic {
    /// Compares presented credentials against the configured pair.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Bearer policy; the JWK is parsed once at load time and the verifier
/// retained for the lifetime of the configuration.
#[derive(Debug)]
pub struct AuthBearer {
    pub public_key: String,
    pub verifier: JwtVerifier,
}

/// Response-cache policy.
#[derive(Debug, Clone)]
pub struct Cache {
    pub ttl: Duration,
    pub keys: Vec<CacheKey>,
}

/// One fingerprint source for cache and rate-limit keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    /// Named request header, first value, case-insensitive lookup.
    Header(String),
    /// Named query-string parameter, first occurrence, exact name.
    Query(String),
}

/// Rate-limit policy: per-window caps plus fingerprint sources.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub per_day: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_minute: Option<u64>,
    pub per_second: Option<u64>,
    pub keys: Vec<CacheKey>,
}

impl GatewayConfig {
    /// Decodes and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Yaml` when the document is malformed or contains
    /// unknown fields, and `ProxyError::InvalidConfig` naming the offending
    /// service/route on any constraint violation.
    pub fn from_yaml(input: &str) -> Result<Self> {
        let file: schema::GatewayConfigFile = serde_yaml::from_str(input)?;
        let redis = RedisConfig::resolve(file.redis);

        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(file.services.len());
        for (idx, svc) in file.services.into_iter().enumerate() {
            let svc = Service::resolve(svc, idx, &redis)?;
            if !seen.insert(svc.name.clone()) {
                return Err(ProxyError::InvalidConfig(format!(
                    "service {:?} already exists",
                    svc.name
                )));
            }
            services.push(svc);
        }

        Ok(Self { redis, services })
    }

    /// Reads and validates a configuration file.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

impl Service {
    fn resolve(file: schema::ServiceFile, idx: usize, redis: &RedisConfig) -> Result<Self> {
        let name = file.name.trim().to_string();
        if name.is_empty() {
            return Err(ProxyError::InvalidConfig(format!(
                "in service #{idx}: name is required"
            )));
        }

        let addresses = clean_addresses(file.addresses);
        if addresses.is_empty() {
            return Err(ProxyError::InvalidConfig(format!(
                "in service {name:?}: addresses is required"
            )));
        }

        let mut routes = Vec::with_capacity(file.routes.len());
        for rg in file.routes {
            routes.push(RouteGroup::resolve(rg, &name, redis, None)?);
        }

        Ok(Self {
            path_prefix: format!("/{name}"),
            name,
            addresses,
            routes,
        })
    }
}

impl RouteGroup {
    fn resolve(
        file: schema::RouteGroupFile,
        service: &str,
        redis: &RedisConfig,
        parent: Option<&RouteGroup>,
    ) -> Result<Self> {
        let mut name = file.name.trim().to_string();
        if name.is_empty() {
            if let Some(parent) = parent {
                name = parent.name.clone();
            }
        }

        let auth = match file.auth {
            Some(a) => Some(Arc::new(Auth::resolve(a, service, &name)?)),
            None => parent.and_then(|p| p.auth.clone()),
        };
        let cache = match file.cache {
            Some(c) => Some(Arc::new(Cache::resolve(c, service, &name, redis)?)),
            None => parent.and_then(|p| p.cache.clone()),
        };
        let rate_limit = match file.ratelimit {
            Some(r) => Some(Arc::new(RateLimit::resolve(r, service, &name, redis)?)),
            None => parent.and_then(|p| p.rate_limit.clone()),
        };

        let mut group = Self {
            name,
            method: file.method.trim().to_string(),
            path: file.path.trim().to_string(),
            auth,
            cache,
            rate_limit,
            routes: Vec::new(),
        };

        for child in file.routes.into_iter().flatten() {
            let child = Self::resolve(child, service, redis, Some(&group))?;
            group.routes.push(child);
        }

        Ok(group)
    }
}

impl Auth {
    fn resolve(file: schema::AuthFile, service: &str, route: &str) -> Result<Self> {
        let basic = match file.basic {
            Some(b) => {
                let username = b.username.trim().to_string();
                let password = b.password.trim().to_string();
                if username.is_empty() || password.is_empty() {
                    return Err(route_error(
                        service,
                        route,
                        "basic auth username and password are both required",
                    ));
                }
                Some(AuthBasic { username, password })
            }
            None => None,
        };

        let bearer = match file.bearer {
            Some(b) => {
                let public_key = b.publickey.trim().to_string();
                if public_key.is_empty() {
                    return Err(route_error(service, route, "bearer auth requires publickey"));
                }
                let verifier = JwtVerifier::new(&public_key).map_err(|e| {
                    route_error(
                        service,
                        route,
                        &format!("bearer auth can't load public key: {e}"),
                    )
                })?;
                Some(AuthBearer {
                    public_key,
                    verifier,
                })
            }
            None => None,
        };

        Ok(Self { basic, bearer })
    }
}

impl Cache {
    fn resolve(
        file: schema::CacheFile,
        service: &str,
        route: &str,
        redis: &RedisConfig,
    ) -> Result<Self> {
        if !redis.configured() {
            return Err(route_error(service, route, "cache and ratelimit require redis"));
        }

        let ttl = match file.ttl {
            Some(s) => parse_duration(&s)
                .map_err(|e| route_error(service, route, &format!("cache ttl: {e}")))?,
            None => Duration::ZERO,
        };
        if ttl < Duration::from_secs(1) {
            return Err(route_error(service, route, "cache ttl must be at least 1s"));
        }

        Ok(Self {
            ttl,
            keys: resolve_keys(file.keys, service, route)?,
        })
    }
}

impl RateLimit {
    fn resolve(
        file: schema::RateLimitFile,
        service: &str,
        route: &str,
        redis: &RedisConfig,
    ) -> Result<Self> {
        if !redis.configured() {
            return Err(route_error(service, route, "cache and ratelimit require redis"));
        }

        let caps = [file.day, file.hour, file.minute, file.second];
        if !caps.iter().any(|c| matches!(c, Some(n) if *n > 0)) {
            return Err(route_error(
                service,
                route,
                "ratelimit needs at least one of day, hour, minute or second",
            ));
        }

        Ok(Self {
            per_day: file.day,
            per_hour: file.hour,
            per_minute: file.minute,
            per_second: file.second,
            keys: resolve_keys(file.keys, service, route)?,
        })
    }
}

fn resolve_keys(
    keys: Vec<schema::CacheKeyFile>,
    service: &str,
    route: &str,
) -> Result<Vec<CacheKey>> {
    keys.into_iter()
        .map(|k| {
            let header = k.header.map(|h| h.trim().to_string()).filter(|h| !h.is_empty());
            let query = k.query.map(|q| q.trim().to_string()).filter(|q| !q.is_empty());
            match (header, query) {
                (Some(h), None) => Ok(CacheKey::Header(h)),
                (None, Some(q)) => Ok(CacheKey::Query(q)),
                _ => Err(route_error(
                    service,
                    route,
                    "key must set exactly one of header or query",
                )),
            }
        })
        .collect()
}

fn route_error(service: &str, route: &str, msg: &str) -> ProxyError {
    ProxyError::InvalidConfig(format!("in service {service:?}: route {route:?}: {msg}"))
}

fn clean_addresses(addresses: Vec<String>) -> Vec<String> {
    addresses
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Parses durations of the form `300ms`, `30s`, `1h2m`. Units: `ns`, `us`,
/// `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let bytes = input.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let value: f64 = input[start..i]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let nanos_per_unit: f64 = match &input[unit_start..i] {
            "ns" => 1.0,
            "us" | "\u{b5}s" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JWK: &str = "{\"use\":\"sign\",\"kty\":\"oct\",\"kid\":\"005456ff-1262-4bf0-a608-8534e1fe2763\",\"alg\":\"HS256\",\"k\":\"L0FCL4hivd7ShePdJnzEEoqlwoOfCrkcqdbXdADNk0s523xV7C5Sr6GiRIMpvNIelEsR6ta7MZnELY4JoHrm_w\"}";

    const REDIS: &str = "
redis:
  readaddresses: [\"localhost:6379\"]
  writeaddresses: [\"localhost:6379\"]
";

    #[test]
    fn test_minimal_config() {
        let conf = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        method: GET
        path: /
",
        )
        .unwrap();
        assert_eq!(conf.services.len(), 1);
        assert_eq!(conf.services[0].name, "mock");
        assert_eq!(conf.services[0].path_prefix, "/mock");
        assert_eq!(conf.services[0].routes[0].method, "GET");
        assert!(!conf.redis.configured());
    }

    #[test]
    fn test_unknown_field_fails() {
        assert!(GatewayConfig::from_yaml("bogus: true").is_err());
        assert!(GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        retries: 3
"
        )
        .is_err());
    }

    #[test]
    fn test_empty_service_name_fails() {
        let err = GatewayConfig::from_yaml(
            "
services:
  - name: \"   \"
    addresses: [\"127.0.0.1:8080\"]
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("name is required"));
    }

    #[test]
    fn test_duplicate_service_name_fails() {
        let err = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
  - name: mock
    addresses: [\"127.0.0.1:8081\"]
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_missing_addresses_fails() {
        let err = GatewayConfig::from_yaml("services:\n  - name: mock\n").unwrap_err();
        assert!(err.to_string().contains("addresses is required"));
    }

    #[test]
    fn test_string_fields_trimmed() {
        let conf = GatewayConfig::from_yaml(
            "
services:
  - name: \"  mock  \"
    addresses: [\"  127.0.0.1:8080  \", \"   \"]
",
        )
        .unwrap();
        assert_eq!(conf.services[0].name, "mock");
        assert_eq!(conf.services[0].addresses, vec!["127.0.0.1:8080"]);
    }

    #[test]
    fn test_redis_addresses_cleaned() {
        let conf = GatewayConfig::from_yaml(
            "
redis:
  readaddresses: [\"  localhost:6379  \"]
  writeaddresses: [\"   \"]
",
        )
        .unwrap();
        assert_eq!(conf.redis.read_addresses, vec!["localhost:6379"]);
        assert!(conf.redis.write_addresses.is_empty());
        assert!(!conf.redis.configured());
    }

    #[test]
    fn test_cache_requires_redis() {
        let err = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        cache:
          ttl: 30s
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cache and ratelimit require redis"));
    }

    #[test]
    fn test_cache_ttl_too_short_fails() {
        let yaml = format!(
            "{REDIS}
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        cache:
          ttl: 500ms
"
        );
        let err = GatewayConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("cache ttl must be at least 1s"));
    }

    #[test]
    fn test_cache_policy_resolved() {
        let yaml = format!(
            "{REDIS}
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        cache:
          ttl: 60s
          keys:
            - header: X-Tenant
            - query: page
"
        );
        let conf = GatewayConfig::from_yaml(&yaml).unwrap();
        let cache = conf.services[0].routes[0].cache.as_ref().unwrap();
        assert_eq!(cache.ttl, Duration::from_secs(60));
        assert_eq!(
            cache.keys,
            vec![
                CacheKey::Header("X-Tenant".to_string()),
                CacheKey::Query("page".to_string()),
            ]
        );
    }

    #[test]
    fn test_cache_key_must_be_exactly_one() {
        let yaml = format!(
            "{REDIS}
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        cache:
          ttl: 60s
          keys:
            - header: X-Tenant
              query: page
"
        );
        let err = GatewayConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one of header or query"));
    }

    #[test]
    fn test_ratelimit_needs_nonzero_cap() {
        let empty = format!(
            "{REDIS}
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        ratelimit:
          keys: []
"
        );
        assert!(GatewayConfig::from_yaml(&empty)
            .unwrap_err()
            .to_string()
            .contains("ratelimit needs at least one"));

        let zeroed = format!(
            "{REDIS}
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        ratelimit:
          day: 0
          second: 0
"
        );
        assert!(GatewayConfig::from_yaml(&zeroed)
            .unwrap_err()
            .to_string()
            .contains("ratelimit needs at least one"));
    }

    #[test]
    fn test_basic_auth_requires_both_fields() {
        let err = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        auth:
          basic:
            username: test
",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("username and password are both required"));
    }

    #[test]
    fn test_bearer_auth_bad_key_fails() {
        let err = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        auth:
          bearer:
            publickey: \"{}\"
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("can't load public key"));
    }

    #[test]
    fn test_bearer_auth_valid_key() {
        let yaml = format!(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
        auth:
          bearer:
            publickey: '{JWK}'
"
        );
        let conf = GatewayConfig::from_yaml(&yaml).unwrap();
        let auth = conf.services[0].routes[0].auth.as_ref().unwrap();
        assert!(auth.bearer.is_some());
    }

    #[test]
    fn test_policy_inherited_by_reference() {
        let conf = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: api
        auth:
          basic:
            username: test
            password: test
        routes:
          - name: users
            path: /users
          - name: admin
            path: /admin
            auth:
              basic:
                username: admin
                password: admin
",
        )
        .unwrap();

        let parent = &conf.services[0].routes[0];
        let inherited = &parent.routes[0];
        let overridden = &parent.routes[1];

        assert!(Arc::ptr_eq(
            parent.auth.as_ref().unwrap(),
            inherited.auth.as_ref().unwrap()
        ));
        assert!(!Arc::ptr_eq(
            parent.auth.as_ref().unwrap(),
            overridden.auth.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_name_inherited_from_parent() {
        let conf = GatewayConfig::from_yaml(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: api
        routes:
          - path: /users
",
        )
        .unwrap();
        assert_eq!(conf.services[0].routes[0].routes[0].name, "api");
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h2m").unwrap(), Duration::from_secs(3720));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }
}
