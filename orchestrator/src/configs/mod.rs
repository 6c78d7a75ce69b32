mod benchmark;

pub use benchmark::{BACKENDS, BenchmarkConfig};
