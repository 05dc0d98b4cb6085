//! Route compilation and path matching.
//!
//! Each service's route-group tree is flattened, in declaration order and
//! depth-first pre-order, into a linear table of compiled path globs. Request
//! matching is a first-match linear scan; callers must not rely on
//! longest-match semantics.

use crate::config::{Auth, Cache, GatewayConfig, RateLimit, RouteGroup, Service};
use crate::error::{ProxyError, Result};
use regex::Regex;
use std::sync::Arc;

/// A compiled shell-style path glob: `*` matches any run of characters,
/// `?` matches a single character, everything else is literal.
#[derive(Debug, Clone)]
pub struct PathGlob {
    regex: Regex,
}

impl PathGlob {
    /// Compiles a glob pattern.
    pub fn compile(pattern: &str) -> Result<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(&c.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            ProxyError::InvalidConfig(format!("invalid route pattern {pattern:?}: {e}"))
        })?;
        Ok(Self { regex })
    }

    /// Tests a request path against the compiled pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Everything the pipeline needs once a route has matched: identity for
/// metrics and the resolved policy blocks of the originating group.
#[derive(Debug)]
pub struct RouteTarget {
    /// Owning service name.
    pub service: String,
    /// The service mount point, `/<service>`.
    pub path_prefix: String,
    /// Resolved group name.
    pub route: String,
    /// Required method; empty matches any method.
    pub method: String,
    /// Concatenation of the group's path with all its ancestors' paths.
    pub absolute_path: String,
    pub auth: Option<Arc<Auth>>,
    pub cache: Option<Arc<Cache>>,
    pub rate_limit: Option<Arc<RateLimit>>,
}

/// A single entry in the match table.
#[derive(Debug)]
pub struct Route {
    /// The full `/<service>/<absolute path>` glob string.
    pub pattern: String,
    glob: PathGlob,
    pub target: Arc<RouteTarget>,
}

impl Route {
    /// Tests a request path against this route.
    pub fn matches(&self, path: &str) -> bool {
        self.glob.matches(path)
    }
}

/// Ordered list of compiled routes; first match wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Flattens every service's route-group tree into a match table.
    pub fn compile(conf: &GatewayConfig) -> Result<Self> {
        let mut routes = Vec::new();
        for svc in &conf.services {
            for group in &svc.routes {
                compile_group(svc, group, "", &mut routes)?;
            }
        }
        Ok(Self { routes })
    }

    /// Returns the first route whose pattern matches the request path.
    pub fn match_path(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    /// Returns all compiled routes in match order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn compile_group(
    svc: &Service,
    group: &RouteGroup,
    ancestors: &str,
    out: &mut Vec<Route>,
) -> Result<()> {
    let absolute_path = format!("{}{}", ancestors, group.path);

    // Groups without a path are policy containers, not endpoints.
    if !group.path.is_empty() {
        let pattern = format!("{}{}", svc.path_prefix, absolute_path);
        out.push(Route {
            glob: PathGlob::compile(&pattern)?,
            target: Arc::new(RouteTarget {
                service: svc.name.clone(),
                path_prefix: svc.path_prefix.clone(),
                route: group.name.clone(),
                method: group.method.clone(),
                absolute_path: absolute_path.clone(),
                auth: group.auth.clone(),
                cache: group.cache.clone(),
                rate_limit: group.rate_limit.clone(),
            }),
            pattern,
        });
    }

    for child in &group.routes {
        compile_group(svc, child, &absolute_path, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn table(yaml: &str) -> RouteTable {
        let conf = GatewayConfig::from_yaml(yaml).unwrap();
        RouteTable::compile(&conf).unwrap()
    }

    #[test]
    fn test_glob_wildcards() {
        let glob = PathGlob::compile("/api/*/users").unwrap();
        assert!(glob.matches("/api/v1/users"));
        assert!(glob.matches("/api/v1/extra/users"));
        assert!(!glob.matches("/api/v1/users/42"));

        let glob = PathGlob::compile("/api/v?").unwrap();
        assert!(glob.matches("/api/v1"));
        assert!(!glob.matches("/api/v10"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let glob = PathGlob::compile("/exact.path").unwrap();
        assert!(glob.matches("/exact.path"));
        assert!(!glob.matches("/exactXpath"));
    }

    #[test]
    fn test_pattern_is_prefix_plus_absolute_path() {
        let table = table(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: api
        path: /api
        routes:
          - name: users
            path: /users
            routes:
              - name: detail
                path: /*
",
        );
        let patterns: Vec<&str> = table.routes().iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["/mock/api", "/mock/api/users", "/mock/api/users/*"]);

        let detail = &table.routes()[2];
        assert_eq!(detail.target.absolute_path, "/api/users/*");
        assert_eq!(
            detail.pattern,
            format!("{}{}", detail.target.path_prefix, detail.target.absolute_path)
        );
    }

    #[test]
    fn test_containers_are_not_endpoints() {
        let table = table(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: group
        routes:
          - name: leaf
            path: /leaf
",
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes()[0].pattern, "/mock/leaf");
    }

    #[test]
    fn test_first_match_wins() {
        let table = table(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: wildcard
        path: /*
      - name: specific
        path: /users
",
        );
        let matched = table.match_path("/mock/users").unwrap();
        assert_eq!(matched.target.route, "wildcard");
    }

    #[test]
    fn test_declaration_order_across_services() {
        let table = table(
            "
services:
  - name: alpha
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
  - name: beta
    addresses: [\"127.0.0.1:8081\"]
    routes:
      - name: root
        path: /
",
        );
        assert_eq!(table.routes()[0].pattern, "/alpha/");
        assert_eq!(table.routes()[1].pattern, "/beta/");
    }

    #[test]
    fn test_no_match_returns_none() {
        let table = table(
            "
services:
  - name: mock
    addresses: [\"127.0.0.1:8080\"]
    routes:
      - name: root
        path: /
",
        );
        assert!(table.match_path("/other/").is_none());
        assert!(table.match_path("/mock").is_none());
    }
}
