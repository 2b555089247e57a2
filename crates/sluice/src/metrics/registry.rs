//! Global registry of named reporting variables
//!
//! A process-global mapping from qualified name (`"<namespace>.<name>"`) to
//! an integer or floating counter. Registration is idempotent under an
//! exclusive lock: re-registering a name returns a handle to the existing
//! variable, so a metric name has exactly one underlying variable for the
//! lifetime of the process. No removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::error;

/// Global metrics registry instance.
static METRICS_REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Integer reporting variable with atomic add/set.
#[derive(Debug, Clone)]
pub struct VarInt(Arc<AtomicI64>);

impl VarInt {
    fn new() -> Self {
        Self(Arc::new(AtomicI64::new(0)))
    }

    /// Detached variable, not visible in any registry. Useful in tests and
    /// as the fallback for a kind-mismatched registration.
    pub fn detached() -> Self {
        Self::new()
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// True when both handles point at the same underlying variable.
    pub fn same_var(&self, other: &VarInt) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Floating reporting variable; stored as f64 bits in an atomic word.
#[derive(Debug, Clone)]
pub struct VarFloat(Arc<AtomicU64>);

impl VarFloat {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0f64.to_bits())))
    }

    pub fn detached() -> Self {
        Self::new()
    }

    pub fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn same_var(&self, other: &VarFloat) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Int(VarInt),
    Float(VarFloat),
}

/// Thread-safe registry of reporting variables.
pub struct MetricsRegistry {
    vars: Mutex<HashMap<String, Slot>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
        }
    }

    /// Get the global metrics registry, initializing it if necessary.
    pub fn global() -> Arc<MetricsRegistry> {
        METRICS_REGISTRY
            .get_or_init(|| Arc::new(MetricsRegistry::new()))
            .clone()
    }

    /// Create or fetch the integer variable `"<ns>.<name>"`.
    ///
    /// A name already registered as a float is a configuration bug; it is
    /// logged and a detached variable is returned so the pipeline keeps
    /// running, with that metric invisible to the endpoint.
    pub fn int(&self, ns: &str, name: &str) -> VarInt {
        let qualified = qualify(ns, name);
        let mut vars = self.vars.lock();
        match vars
            .entry(qualified.clone())
            .or_insert_with(|| Slot::Int(VarInt::new()))
        {
            Slot::Int(var) => var.clone(),
            Slot::Float(_) => {
                error!(metric = %qualified, "metric registered as float, int requested");
                VarInt::detached()
            }
        }
    }

    /// Create or fetch the floating variable `"<ns>.<name>"`.
    pub fn float(&self, ns: &str, name: &str) -> VarFloat {
        let qualified = qualify(ns, name);
        let mut vars = self.vars.lock();
        match vars
            .entry(qualified.clone())
            .or_insert_with(|| Slot::Float(VarFloat::new()))
        {
            Slot::Float(var) => var.clone(),
            Slot::Int(_) => {
                error!(metric = %qualified, "metric registered as int, float requested");
                VarFloat::detached()
            }
        }
    }

    /// Dump every variable as a JSON object, name → current value.
    pub fn snapshot(&self) -> serde_json::Value {
        let vars = self.vars.lock();
        let mut map = serde_json::Map::with_capacity(vars.len());
        for (name, slot) in vars.iter() {
            let value = match slot {
                Slot::Int(v) => serde_json::Value::from(v.get()),
                Slot::Float(v) => serde_json::Value::from(v.get()),
            };
            map.insert(name.clone(), value);
        }
        serde_json::Value::Object(map)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn qualify(ns: &str, name: &str) -> String {
    format!("{}.{}", ns, name)
}

/// Create or fetch an integer var in the global registry. Expected to be
/// called from dynamic creation sites (item factories, frame factories) so
/// that all processors inside a single table share one reporting metric.
pub fn report_int(ns: &str, name: &str) -> VarInt {
    MetricsRegistry::global().int(ns, name)
}

/// Create or fetch a floating var in the global registry; see [`report_int`].
pub fn report_float(ns: &str, name: &str) -> VarFloat {
    MetricsRegistry::global().float(ns, name)
}
