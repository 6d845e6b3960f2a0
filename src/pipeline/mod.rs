//! Per-event processing stages: normalize → throttle → enrich

pub mod geo;
pub mod normalize;
pub mod throttle;

pub use geo::GeoResolver;
pub use normalize::{admit, normalize, AdmittedUpdate};
pub use throttle::{AllowFilter, ThrottleDecision, ThrottleEngine};
