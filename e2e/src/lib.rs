pub mod assertions;
pub mod cleanup;
pub mod common;
pub mod config;
pub mod correlate;
pub mod crd;
pub mod disks;
pub mod error;
pub mod fixtures;
pub mod local_volume_e2e;
pub mod objects;
pub mod poll;
#[cfg(test)]
mod testing;

pub use error::Error;
