use std::sync::{Arc, LazyLock};

use opentelemetry::{
    global,
    metrics::{Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton for pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("pool.name");
const KEY_STATE: Key = Key::from_static_str("pool.resource.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of resources that are currently in state described by the state attribute.
    pub(crate) count: Gauge<u64>,
    /// The time it took to borrow a resource from the pool.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between borrowing a resource and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
    /// The minimum number of idle resources kept in the pool.
    pub(crate) idle_min: Gauge<u64>,
    /// The maximum number of resources allowed.
    pub(crate) max: Gauge<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    pub(crate) fn new() -> Self {
        let meter = global::meter("gatepool");
        let count = meter
            .u64_gauge("pool.resource.count")
            .with_description(
                "The number of resources that are currently in state described by the state attribute.",
            )
            .build();
        let wait_time = meter
            .f64_histogram("pool.resource.wait_time")
            .with_unit("s")
            .with_description("The time it took to borrow a resource from the pool.")
            .build();
        let use_time = meter
            .f64_histogram("pool.resource.use_time")
            .with_unit("s")
            .with_description("The time between borrowing a resource and returning it to the pool.")
            .build();
        let idle_min = meter
            .u64_gauge("pool.resource.idle.min")
            .with_description("The minimum number of idle resources kept in the pool.")
            .build();
        let max = meter
            .u64_gauge("pool.resource.max")
            .with_description("The maximum number of resources allowed.")
            .build();
        Metrics {
            count,
            wait_time,
            use_time,
            idle_min,
            max,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue; 1], state: &PoolState) {
        self.max.record(state.max_size as u64, label);
        self.idle_min.record(state.min_idle as u64, label);
        for (status, value) in [
            ("total", state.size),
            ("idle", state.idle),
            ("used", state.in_use),
        ] {
            self.count
                .record(value as u64, &status_kv(label[0].clone(), status));
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

pub(crate) fn pool_kv(name: &str) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name.to_owned())]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Snapshot of pool state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolState {
    /// Maximum total (`idle` + `in_use`) number of resources in the pool.
    pub max_size: usize,
    /// Current total (`idle` + `in_use`) number of resources in the pool.
    pub size: usize,
    /// Current number of idle (not borrowed) resources.
    pub idle: usize,
    /// Current number of borrowed resources.
    pub in_use: usize,
    /// Resources being constructed or validated right now.
    pub pending: usize,
    /// Minimum number of idle resources to keep in the pool.
    pub min_idle: usize,
    /// Whether the pool is closed.
    pub closed: bool,
}
