use anyhow::Result;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    pub registry: Registry,
    pub requests_total: IntCounterVec,
    pub route_failures_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub batch_items_total: IntCounterVec,
    pub request_latency_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let route_failures_total = IntCounterVec::new(
            Opts::new("gateway_route_failures_total", "Provider route failures"),
            &["alias", "provider"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("gateway_rate_limited_total", "Rate-limited requests by scope kind"),
            &["kind"],
        )?;
        let batch_items_total = IntCounterVec::new(
            Opts::new("gateway_batch_items_total", "Batch items by outcome"),
            &["outcome"],
        )?;
        let request_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "gateway_request_latency_seconds",
            "End-to-end request latency",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(route_failures_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(batch_items_total.clone()))?;
        registry.register(Box::new(request_latency_seconds.clone()))?;
        Ok(Self {
            registry,
            requests_total,
            route_failures_total,
            rate_limited_total,
            batch_items_total,
            request_latency_seconds,
        })
    }

    pub fn record_request(&self, endpoint: &str, status: u16) {
        self.requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut out = Vec::new();
        encoder.encode(&families, &mut out)?;
        Ok(Response::builder()
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(out))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_renders() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("/v1/chat/completions", 200);
        metrics.record_request("/v1/chat/completions", 403);
        let resp = metrics.render().unwrap();
        assert_eq!(resp.status(), 200);
    }
}
