//! Fixed-resolution, gap-aware time series.
//!
//! A series covers an inclusive `[t_start, t_end]` range at a fixed step and
//! is pre-filled with NaN sentinels; a NaN slot is a genuine data gap, not an
//! error.  Counter-semantics series are rate-converted in place after all
//! fetch jobs complete.

/// A pre-scaled, NaN-initialized vector of samples over an inclusive range.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    t_start: i64,
    t_end: i64,
    t_step: i64,
    data: Vec<f64>,
}

impl TimeSeries {
    pub fn new(t_start: i64, t_end: i64, t_step: i64) -> Self {
        debug_assert!(t_step > 0, "time step must be positive");
        debug_assert!(t_end >= t_start, "series range must not be inverted");
        let len = ((t_end - t_start) / t_step + 1) as usize;
        Self {
            t_start,
            t_end,
            t_step,
            data: vec![f64::NAN; len],
        }
    }

    pub fn t_start(&self) -> i64 {
        self.t_start
    }

    pub fn t_end(&self) -> i64 {
        self.t_end
    }

    pub fn t_step(&self) -> i64 {
        self.t_step
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value at absolute timestamp `t` (rounded down to its slot).
    pub fn at(&self, t: i64) -> f64 {
        debug_assert!(t >= self.t_start && t <= self.t_end);
        self.data[((t - self.t_start) / self.t_step) as usize]
    }

    /// Overwrite the slot covering absolute timestamp `t`.
    pub fn set_at(&mut self, t: i64, value: f64) {
        debug_assert!(t >= self.t_start && t <= self.t_end);
        let idx = ((t - self.t_start) / self.t_step) as usize;
        self.data[idx] = value;
    }

    /// The absolute timestamp of slot `i`.
    pub fn when(&self, i: usize) -> i64 {
        self.t_start + self.t_step * i as i64
    }

    pub fn get(&self, i: usize) -> f64 {
        self.data[i]
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Rate-convert a monotonically-increasing counter series to per-second
    /// deltas, leaving NaN where conversion is impossible.
    ///
    /// Slot `i` becomes NaN if slot `i` or `i-1` is NaN (or `i == 0`), and
    /// NaN on counter regression (e.g. a restart).  Each value divides by the
    /// step before subtracting, so two large nearly-equal magnitudes are not
    /// subtracted first.  Results go to a fresh buffer that replaces the data
    /// wholesale: conversion must never read an already-converted neighbor.
    pub fn rate_convert(&mut self) {
        let mut rated = vec![f64::NAN; self.data.len()];
        let step = self.t_step as f64;
        for i in 0..self.data.len() {
            let current = self.data[i];
            let previous = if i > 0 { self.data[i - 1] } else { f64::NAN };
            rated[i] = if !current.is_finite() {
                current
            } else if !previous.is_finite() {
                previous
            } else if current < previous {
                // counter regression
                f64::NAN
            } else {
                (current / step) - (previous / step)
            };
        }
        self.data = rated;
    }

    /// Replace every NaN gap with the given value.
    pub fn null_convert(&mut self, value: f64) {
        for slot in &mut self.data {
            if !slot.is_finite() {
                *slot = value;
            }
        }
    }
}
