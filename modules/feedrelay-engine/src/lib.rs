pub mod comparisons;
pub mod consistency;
pub mod cycle;
pub mod dedup;
pub mod delivery;
pub mod seed;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod worker;
