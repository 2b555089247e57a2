//! Process-global reporting variables
//!
//! Tables, topics, and windows report through named counters registered in a
//! global registry. Registration is idempotent so that processors created
//! dynamically (per key, per frame) share one underlying variable; see
//! [`report_int`] and [`report_float`].

pub mod registry;
pub mod server;

pub use registry::{report_float, report_int, MetricsRegistry, VarFloat, VarInt};
pub use server::{serve_metrics, MetricsServerConfig};
