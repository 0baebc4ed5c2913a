use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder};

// Gateway statistics, exposed on /metrics.
#[derive(Clone)]
pub struct GatewayStatistics {
    // requests by route class
    pub requests: CounterVec,
    // requests that made it past admission, by tenant, only while admission
    // is enabled so arbitrary path segments never become series
    pub tenant_requests: CounterVec,
    // terminal errors by reason
    pub rejections: CounterVec,
    // non-2xx or failed writes by target
    pub forward_failures: CounterVec,
    // wall time of a write fan-out
    pub fanout_ms: Histogram,
    pub admitted_tenants: IntGauge,
}

impl GatewayStatistics {

    pub fn register(r: &Registry) -> Result<GatewayStatistics, prometheus::Error> {
        let requests = CounterVec::new(
            Opts::new("open_metrics_gateway_requests", "number of requests"),
            &["route"],
        )?;
        r.register(Box::new(requests.clone()))?;

        let tenant_requests = CounterVec::new(
            Opts::new("open_metrics_gateway_tenant_requests", "number of admitted tenant requests"),
            &["tenant_id"],
        )?;
        r.register(Box::new(tenant_requests.clone()))?;

        let rejections = CounterVec::new(
            Opts::new("open_metrics_gateway_rejections", "number of rejected requests"),
            &["reason"],
        )?;
        r.register(Box::new(rejections.clone()))?;

        let forward_failures = CounterVec::new(
            Opts::new("open_metrics_gateway_forward_failures", "number of failed writes"),
            &["endpoint"],
        )?;
        r.register(Box::new(forward_failures.clone()))?;

        let fanout_ms = Histogram::with_opts(
            HistogramOpts::new("open_metrics_gateway_fanout_ms", "write fan-out time milliseconds")
                .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 800.0, 1200.0, 2000.0]),
        )?;
        r.register(Box::new(fanout_ms.clone()))?;

        let admitted_tenants = IntGauge::new("open_metrics_gateway_admitted_tenants", "tenants on the admission list")?;
        r.register(Box::new(admitted_tenants.clone()))?;

        Ok(GatewayStatistics {
            requests,
            tenant_requests,
            rejections,
            forward_failures,
            fanout_ms,
            admitted_tenants,
        })
    }
}

// Text exposition of everything in the registry.
pub fn encode_metrics(r: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder.encode(&r.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let r = Registry::new();
        assert!(GatewayStatistics::register(&r).is_ok());
        assert!(GatewayStatistics::register(&r).is_err());
        assert!(GatewayStatistics::register(&Registry::new()).is_ok());
    }

    #[test]
    fn exposes_recorded_values() {
        let r = Registry::new();
        let stats = GatewayStatistics::register(&r).unwrap();
        stats.requests.with_label_values(&["tenant_query"]).inc();
        stats.rejections.with_label_values(&["forbidden"]).inc_by(2.0);
        stats.admitted_tenants.set(3);

        let text = encode_metrics(&r).unwrap();
        assert!(text.contains("open_metrics_gateway_requests{route=\"tenant_query\"} 1"));
        assert!(text.contains("open_metrics_gateway_rejections{reason=\"forbidden\"} 2"));
        assert!(text.contains("open_metrics_gateway_admitted_tenants 3"));
    }
}
