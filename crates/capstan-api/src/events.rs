//! Event reason constants recorded by the controllers.

/// An AutoscalingPolicy raised a scale up alert.
pub const SCALE_UP_ALERTED: &str = "ScaleUpAlerted";
/// An AutoscalingPolicy raised a scale down alert.
pub const SCALE_DOWN_ALERTED: &str = "ScaleDownAlerted";
/// An AutoscalingGroup was scaled up.
pub const SCALED_UP: &str = "ScaledUp";
/// An AutoscalingGroup was scaled down.
pub const SCALED_DOWN: &str = "ScaledDown";
/// A scale request was ignored (suspension, cooldown, or breached bounds).
pub const SCALE_IGNORED: &str = "ScaleIgnored";
/// A scale operation failed at the engine.
pub const SCALE_ERROR: &str = "ScaleError";
