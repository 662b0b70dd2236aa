//! Logical time. All simulated durations and timestamps are integer
//! microseconds; floating point only appears at the reporting edge.

/// Logical simulation time in microseconds.
pub type Micros = u64;

/// Convert a logical duration to milliseconds for reporting.
pub fn micros_to_ms(us: Micros) -> f64 {
    us as f64 / 1_000.0
}

/// Convert a logical duration to seconds for reporting.
pub fn micros_to_secs(us: Micros) -> f64 {
    us as f64 / 1_000_000.0
}
