//! Tether Metrics - event counters for the engine thread
//!
//! Provides zero-cost counters that completely vanish in production builds via
//! feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use tether_metrics::Counter;
//!
//! let mut counter = Counter::new();
//! counter.increment("tasks.executed", 1);
//! println!("tasks: {}", counter.get("tasks.executed"));
//! ```
//!
//! Without the `metrics` feature every call is a no-op and `get` reports zero.
//! Wrap instrumentation in [`metrics!`] to compile it out entirely.

#[cfg(feature = "metrics")]
mod counter;

#[cfg(feature = "metrics")]
pub use counter::Counter;

/// True when counters actually record values.
pub const ENABLED: bool = cfg!(feature = "metrics");

/// Execute code only when metrics are enabled
///
/// The `cfg` is checked in the calling crate, which must forward its own
/// `metrics` feature to this one.
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default, Clone)]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &str, _value: usize) {}
    pub fn get(&self, _name: &str) -> usize { 0 }
    pub fn snapshot(&self) -> Vec<(String, usize)> { Vec::new() }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_counter_api_compiles_in_both_modes() {
        let mut counter = super::Counter::new();
        counter.increment("tasks.executed", 2);
        if super::ENABLED {
            assert_eq!(counter.get("tasks.executed"), 2);
        } else {
            assert_eq!(counter.get("tasks.executed"), 0);
        }
    }

    #[test]
    fn test_metrics_macro_follows_the_feature() {
        let mut recorded = 0;
        crate::metrics! {
            recorded += 1;
        }
        assert_eq!(recorded, if super::ENABLED { 1 } else { 0 });
    }
}
