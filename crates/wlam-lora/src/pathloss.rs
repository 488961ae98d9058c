//! Propagation loss between a sensor node and the gateway.
//!
//! Total loss is free-space path loss plus a Weissberger vegetation term for
//! the depth of foliage along the path. All values are in dB.
//!
//! # Formulas
//!
//! ```text
//! FSPL(d, f) = 20·log₁₀(d) + 20·log₁₀(f) − 147.55      (d in m, f in Hz)
//!
//! Lveg(dv, f) = 0                                      dv ≤ 0
//!             = 0.45 · f_GHz^0.284 · dv                0 < dv ≤ 14 m
//!             = 1.33 · f_GHz^0.284 · dv^0.588          dv > 14 m
//! ```
//!
//! Weissberger's model is stated for 14 m < dv ≤ 400 m on the upper branch;
//! depths beyond 400 m are extrapolated with the same expression.

use serde::{Deserialize, Serialize};

/// Speed-of-light constant term of the free-space formula in dB.
const FSPL_CONSTANT_DB: f64 = 147.55;

/// Distances below this are clamped before taking the logarithm.
pub const FSPL_MIN_DISTANCE_M: f64 = 1.0;

/// Foliage depth at which Weissberger switches to the power-law branch.
pub const WEISSBERGER_BREAKPOINT_M: f64 = 14.0;

/// Free-space path loss in dB.
pub fn free_space_path_loss_db(distance_m: f64, frequency_hz: f64) -> f64 {
    let d = distance_m.max(FSPL_MIN_DISTANCE_M);
    20.0 * d.log10() + 20.0 * frequency_hz.log10() - FSPL_CONSTANT_DB
}

/// Weissberger excess loss for `depth_m` metres of foliage, in dB.
pub fn weissberger_vegetation_loss_db(depth_m: f64, frequency_hz: f64) -> f64 {
    if depth_m <= 0.0 {
        return 0.0;
    }
    let f_ghz = frequency_hz / 1e9;
    if depth_m <= WEISSBERGER_BREAKPOINT_M {
        0.45 * f_ghz.powf(0.284) * depth_m
    } else {
        1.33 * f_ghz.powf(0.284) * depth_m.powf(0.588)
    }
}

/// Free-space loss plus vegetation loss, in dB.
pub fn total_path_loss_db(distance_m: f64, frequency_hz: f64, vegetation_depth_m: f64) -> f64 {
    free_space_path_loss_db(distance_m, frequency_hz)
        + weissberger_vegetation_loss_db(vegetation_depth_m, frequency_hz)
}

/// Path loss model for one link: fixed foliage depth, variable distance and frequency.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PathLossModel {
    /// Foliage depth along the path in metres.
    pub vegetation_depth_m: f64,
}

impl PathLossModel {
    /// Model with the given foliage depth.
    pub fn new(vegetation_depth_m: f64) -> Self {
        Self { vegetation_depth_m }
    }

    /// Total loss in dB.
    pub fn loss_db(&self, distance_m: f64, frequency_hz: f64) -> f64 {
        total_path_loss_db(distance_m, frequency_hz, self.vegetation_depth_m)
    }
}

/// Breakdown of a path loss computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PathLossBreakdown {
    /// Free-space component in dB.
    pub free_space_db: f64,
    /// Vegetation component in dB.
    pub vegetation_db: f64,
    /// Sum of both components in dB.
    pub total_db: f64,
}

impl PathLossBreakdown {
    /// Compute every component for a link.
    pub fn compute(distance_m: f64, frequency_hz: f64, vegetation_depth_m: f64) -> Self {
        let free_space_db = free_space_path_loss_db(distance_m, frequency_hz);
        let vegetation_db = weissberger_vegetation_loss_db(vegetation_depth_m, frequency_hz);
        Self {
            free_space_db,
            vegetation_db,
            total_db: free_space_db + vegetation_db,
        }
    }
}
