//! Incremental re-matching
//!
//! Discards every automatic match, keeps the manually confirmed ones as
//! ground truth the driver cannot overrule, and re-enters the driver with
//! the same step list.

use crate::error::{DiffError, Result};
use crate::matching::context::MatchingContext;
use crate::matching::driver;
use crate::matching::steps::{names, BasicBlockStep, FunctionStep};

/// Drops all non-manual fixed points and reruns the driver.
///
/// # Errors
/// `Cancelled` when the store holds no manual fixed point; there is
/// nothing to preserve, so a plain re-diff is what the caller wants
/// instead.
pub fn rematch(
    context: &mut MatchingContext,
    function_steps: &[Box<dyn FunctionStep>],
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) -> Result<()> {
    let manual_count = context
        .fixed_points
        .iter()
        .filter(|fixed_point| fixed_point.step() == names::FUNCTION_MANUAL)
        .count();
    if manual_count == 0 {
        return Err(DiffError::Cancelled(
            "incremental matching without manual fixed points".to_string(),
        ));
    }

    for key in context.fixed_points.keys() {
        let automatic = context
            .fixed_points
            .get(key)
            .is_some_and(|fixed_point| fixed_point.step() != names::FUNCTION_MANUAL);
        if automatic {
            context.fixed_points.remove(key);
        }
    }
    context.new_fixed_points.clear();

    driver::match_call_graphs(context, function_steps, basic_block_steps);
    Ok(())
}
