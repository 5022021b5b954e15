pub mod endpoint;
pub mod latency;

pub use endpoint::*;
pub use latency::*;
