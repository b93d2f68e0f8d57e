pub mod controller;
pub mod resources;
pub mod results;
pub mod status;

pub use controller::{reconcile_validation_job, Transition};
pub use resources::{canonical_image, validation_pod_name, ValidationResourceManager};
