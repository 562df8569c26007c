//! The structural matching pipeline: fixed-point store, matching context,
//! step implementations, the iterative driver and incremental re-matching.

pub mod context;
pub mod driver;
pub mod fixed_points;
pub mod incremental;
pub mod lcs;
pub mod steps;
