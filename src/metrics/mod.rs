use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("porter_requests_total", "Total requests").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("porter_requests_status_total", "Requests by status"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn balance_decisions_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "porter_balance_decisions_total",
                "Balance attempts by cluster and outcome",
            ),
            &["cluster", "outcome"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn lottery_skips_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new(
            "porter_lottery_skips_total",
            "Requests that skipped balancing by lottery",
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn title_cache_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("porter_title_cache_total", "Title cache lookups by result"),
            &["result"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn blocked_requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new(
            "porter_blocked_requests_total",
            "Requests denied by the blocklist",
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn limited_requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new(
            "porter_limited_requests_total",
            "Requests rejected by the rate limiter",
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn init_metrics() {
    let _ = requests_total();
    let _ = requests_status_total();
    let _ = lottery_skips_total();
    let _ = blocked_requests_total();
    let _ = limited_requests_total();
    for code in ["204", "403", "412", "429", "500"] {
        requests_status_total().with_label_values(&[code]).inc_by(0);
    }
    for cluster in ["cloud", "nodes"] {
        for outcome in ["ok", "miss"] {
            balance_decisions_total()
                .with_label_values(&[cluster, outcome])
                .inc_by(0);
        }
    }
    for result in ["hit", "miss", "empty", "fetch_error"] {
        title_cache_total().with_label_values(&[result]).inc_by(0);
    }
}

pub fn record(status: StatusCode) {
    init_metrics();
    requests_total().inc();
    let code = status.as_u16().to_string();
    requests_status_total()
        .with_label_values(&[code.as_str()])
        .inc();
}

pub fn record_balance(cluster: &str, ok: bool) {
    init_metrics();
    let outcome = if ok { "ok" } else { "miss" };
    balance_decisions_total()
        .with_label_values(&[cluster, outcome])
        .inc();
}

pub fn record_lottery_skip() {
    init_metrics();
    lottery_skips_total().inc();
}

pub fn record_title_cache(result: &str) {
    init_metrics();
    title_cache_total().with_label_values(&[result]).inc();
}

pub fn record_blocked() {
    init_metrics();
    blocked_requests_total().inc();
}

pub fn record_limited() {
    init_metrics();
    limited_requests_total().inc();
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}
