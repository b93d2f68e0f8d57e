pub mod validationjob;

pub use validationjob::*;
