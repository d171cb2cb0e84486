//! PID setpoint filter
//!
//! Smooths a power target towards the measured value instead of jumping to
//! it in one cycle. The filter is evaluated once per cycle, so time is
//! implicit in the cycle period.
//!
//! # Theory
//! - **P (Proportional)**: Responds to the current error
//! - **I (Integral)**: Responds to accumulated past errors
//! - **D (Derivative)**: Responds to the change of the error since last cycle
//!
//! Output = Kp * error + Ki * Σerror + Kd * (error - previous_error)

use serde::{Deserialize, Serialize};

pub const DEFAULT_P: f64 = 0.3;
pub const DEFAULT_I: f64 = 0.3;
pub const DEFAULT_D: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidFilter {
    /// Proportional gain
    p: f64,
    /// Integral gain
    i: f64,
    /// Derivative gain
    d: f64,

    /// Accumulated error
    error_sum: f64,
    previous_error: f64,

    /// Output limits, usually the allowed range of the target this cycle
    lower: Option<i64>,
    upper: Option<i64>,
}

impl Default for PidFilter {
    fn default() -> Self {
        Self::new(DEFAULT_P, DEFAULT_I, DEFAULT_D)
    }
}

impl PidFilter {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self {
            p,
            i,
            d,
            error_sum: 0.0,
            previous_error: 0.0,
            lower: None,
            upper: None,
        }
    }

    /// Update gains (useful for adaptive tuning)
    pub fn set_gains(&mut self, p: f64, i: f64, d: f64) {
        self.p = p;
        self.i = i;
        self.d = d;
    }

    /// Sets the output limits. Limits in the wrong order are swapped.
    pub fn set_limits(&mut self, lower: Option<i64>, upper: Option<i64>) {
        match (lower, upper) {
            (Some(lo), Some(hi)) if lo > hi => {
                self.lower = Some(hi);
                self.upper = Some(lo);
            }
            _ => {
                self.lower = lower;
                self.upper = upper;
            }
        }
    }

    pub fn reset(&mut self) {
        self.error_sum = 0.0;
        self.previous_error = 0.0;
    }

    /// Next setpoint given the measured `input` and the requested `target`.
    pub fn apply(&mut self, input: i64, target: i64) -> i64 {
        let error = (target - input) as f64;

        // Anti-windup: the integral term alone never exceeds the output limits
        self.error_sum += error;
        if self.i != 0.0 {
            let bound = |limit: Option<i64>| limit.map(|l| l as f64 / self.i);
            let (mut lo, mut hi) = (bound(self.lower), bound(self.upper));
            if self.i < 0.0 {
                std::mem::swap(&mut lo, &mut hi);
            }
            if let Some(lo) = lo {
                self.error_sum = self.error_sum.max(lo);
            }
            if let Some(hi) = hi {
                self.error_sum = self.error_sum.min(hi);
            }
        }

        let output = self.p * error + self.i * self.error_sum + self.d * (error - self.previous_error);
        self.previous_error = error;
        self.clamp(output).round() as i64
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut value = value;
        if let Some(lower) = self.lower {
            value = value.max(lower as f64);
        }
        if let Some(upper) = self.upper {
            value = value.min(upper as f64);
        }
        value
    }

    /// Accumulated error (useful for debugging)
    pub fn error_sum(&self) -> f64 {
        self.error_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_towards_target() {
        let mut pid = PidFilter::new(0.5, 0.2, 0.0);
        let mut measured = 0;
        for _ in 0..100 {
            measured = pid.apply(measured, 1000);
        }
        assert!((measured - 1000).abs() <= 20, "measured {}", measured);
    }

    #[test]
    fn test_output_respects_limits() {
        let mut pid = PidFilter::new(1.0, 1.0, 0.0);
        pid.set_limits(Some(-500), Some(500));
        assert_eq!(pid.apply(0, 5000), 500);
        assert_eq!(pid.apply(0, -5000), -500);
    }

    #[test]
    fn test_no_windup_while_saturated() {
        let mut pid = PidFilter::new(0.0, 1.0, 0.0);
        pid.set_limits(Some(0), Some(100));
        for _ in 0..10 {
            pid.apply(0, 1000);
        }
        assert!(pid.error_sum() <= 100.0);
        // once the target drops the output follows immediately
        assert_eq!(pid.apply(0, -1000), 0);
    }

    #[test]
    fn test_swapped_limits() {
        let mut pid = PidFilter::new(1.0, 0.0, 0.0);
        pid.set_limits(Some(100), Some(-100));
        assert_eq!(pid.apply(0, 1000), 100);
    }

    #[test]
    fn test_reset() {
        let mut pid = PidFilter::default();
        pid.apply(0, 1000);
        pid.reset();
        assert_eq!(pid.error_sum(), 0.0);
    }
}
