//! Prometheus metrics collection and export.
//!
//! Cache timings are labeled by `{service, route, path, method}`; request
//! durations additionally carry the response status. Exposition happens on
//! the admin listener.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels identifying a route.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    /// Owning service name.
    pub service: String,
    /// Route-group name.
    pub route: String,
    /// Absolute path of the route group.
    pub path: String,
    /// HTTP method of the request.
    pub method: String,
}

/// Route labels plus the response status.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub service: String,
    pub route: String,
    pub path: String,
    pub method: String,
    /// HTTP status code of the response.
    pub status: String,
}

/// Global metrics registry, initialized once and shared across tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the gateway pipeline and cache client.
pub struct Metrics {
    registry: Registry,
    cache_get_response: Family<RouteLabels, Histogram>,
    cache_get_response_hit: Family<RouteLabels, Counter>,
    cache_set_response: Family<RouteLabels, Histogram>,
    route_request: Family<RequestLabels, Histogram>,
}

fn duration_histogram() -> Histogram {
    // Buckets: 1ms, 2ms, 4ms, ... 4s
    Histogram::new(exponential_buckets(0.001, 2.0, 13))
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let cache_get_response =
            Family::<RouteLabels, Histogram>::new_with_constructor(duration_histogram);
        registry.register(
            "sx_cache_get_response",
            "Duration of cache response fetches in seconds",
            cache_get_response.clone(),
        );

        let cache_get_response_hit = Family::<RouteLabels, Counter>::default();
        registry.register(
            "sx_cache_get_response_hit",
            "Number of cache response fetches served from the store",
            cache_get_response_hit.clone(),
        );

        let cache_set_response =
            Family::<RouteLabels, Histogram>::new_with_constructor(duration_histogram);
        registry.register(
            "sx_cache_set_response",
            "Duration of cache response stores in seconds",
            cache_set_response.clone(),
        );

        let route_request =
            Family::<RequestLabels, Histogram>::new_with_constructor(duration_histogram);
        registry.register(
            "sx_route_request",
            "End-to-end request duration in seconds",
            route_request.clone(),
        );

        Self {
            registry,
            cache_get_response,
            cache_get_response_hit,
            cache_set_response,
            route_request,
        }
    }

    /// Records the duration of a cache fetch.
    pub fn record_cache_get(labels: &RouteLabels, duration_secs: f64) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .cache_get_response
                .get_or_create(labels)
                .observe(duration_secs);
        }
    }

    /// Counts a cache fetch that was served from the store.
    pub fn record_cache_hit(labels: &RouteLabels) {
        if let Ok(metrics) = METRICS.lock() {
            metrics.cache_get_response_hit.get_or_create(labels).inc();
        }
    }

    /// Records the duration of a cache store.
    pub fn record_cache_set(labels: &RouteLabels, duration_secs: f64) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .cache_set_response
                .get_or_create(labels)
                .observe(duration_secs);
        }
    }

    /// Records the end-to-end duration of a routed request.
    pub fn record_request(labels: &RouteLabels, status: u16, duration_secs: f64) {
        let labels = RequestLabels {
            service: labels.service.clone(),
            route: labels.route.clone(),
            path: labels.path.clone(),
            method: labels.method.clone(),
            status: status.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .route_request
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> RouteLabels {
        RouteLabels {
            service: "mock".to_string(),
            route: "root".to_string(),
            path: "/".to_string(),
            method: "GET".to_string(),
        }
    }

    #[test]
    fn test_record_cache_metrics() {
        Metrics::record_cache_get(&labels(), 0.002);
        Metrics::record_cache_hit(&labels());
        Metrics::record_cache_set(&labels(), 0.004);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("sx_cache_get_response"));
        assert!(encoded.contains("sx_cache_get_response_hit"));
        assert!(encoded.contains("sx_cache_set_response"));
    }

    #[test]
    fn test_record_request() {
        Metrics::record_request(&labels(), 200, 0.05);
        Metrics::record_request(&labels(), 502, 0.01);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("sx_route_request"));
        assert!(encoded.contains("status=\"502\""));
    }

    #[test]
    fn test_metrics_encoding() {
        assert!(Metrics::encode().is_ok());
    }
}
