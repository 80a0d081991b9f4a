//! Feature-gated metric helpers.
//!
//! Every helper compiles to a no-op when the `metrics` feature is off, so
//! call sites never need their own `cfg` attributes.

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_labeled(name: &'static str, label: &'static str, value: &str) {
    metrics::increment_counter!(name, label => value.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_labeled(_name: &'static str, _label: &'static str, _value: &str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_add(name: &'static str, count: u64) {
    metrics::counter!(name, count);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_add(_name: &'static str, _count: u64) {}
