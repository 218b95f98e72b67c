//! Integration flows over the in-process log.

pub mod choreography;
pub mod integrity;
pub mod isolation;
pub mod perf;
pub mod resilience;
