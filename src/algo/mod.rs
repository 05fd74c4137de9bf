pub mod welford;

pub use welford::StreamState;
