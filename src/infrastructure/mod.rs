//! Adapters for the domain ports: storage backends, clocks, event sinks and
//! the currency registry.

pub mod clock;
pub mod currency;
pub mod events;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
