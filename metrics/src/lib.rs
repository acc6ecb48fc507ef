pub mod server;

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    rpc_requests: IntCounterVec,
    active_subscriptions: IntGauge,
    messages_forwarded: IntCounter,
    subscription_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rpc_requests = IntCounterVec::new(
            Opts::new("gateway_rpc_requests_total", "Total number of RPC calls received"),
            &["method"],
        )?;
        registry.register(Box::new(rpc_requests.clone()))?;

        let active_subscriptions = IntGauge::with_opts(Opts::new(
            "gateway_active_subscriptions",
            "Number of open Subscribe streams",
        ))?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        let messages_forwarded = IntCounter::with_opts(Opts::new(
            "gateway_messages_forwarded_total",
            "Total number of overlay messages forwarded to Subscribe streams",
        ))?;
        registry.register(Box::new(messages_forwarded.clone()))?;

        // reason: rejected, overlay_error, shutdown
        let subscription_failures = IntCounterVec::new(
            Opts::new(
                "gateway_subscription_failures_total",
                "Total number of Subscribe calls that ended with an error",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(subscription_failures.clone()))?;

        Ok(Self {
            registry,
            rpc_requests,
            active_subscriptions,
            messages_forwarded,
            subscription_failures,
        })
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn inc_rpc_request(&self, method: &str) {
        self.rpc_requests.with_label_values(&[method]).inc();
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.inc();
    }

    pub fn subscription_closed(&self) {
        self.active_subscriptions.dec();
    }

    pub fn active_subscriptions(&self) -> i64 {
        self.active_subscriptions.get()
    }

    pub fn inc_messages_forwarded(&self) {
        self.messages_forwarded.inc();
    }

    pub fn messages_forwarded(&self) -> u64 {
        self.messages_forwarded.get()
    }

    pub fn inc_subscription_failure(&self, reason: &str) {
        self.subscription_failures.with_label_values(&[reason]).inc();
    }

    pub fn subscription_failures(&self, reason: &str) -> u64 {
        self.subscription_failures.with_label_values(&[reason]).get()
    }

    pub fn rpc_requests(&self, method: &str) -> u64 {
        self.rpc_requests.with_label_values(&[method]).get()
    }
}

pub type SharedMetrics = Arc<Metrics>;
