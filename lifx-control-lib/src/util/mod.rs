pub mod config;
pub mod tracker;
pub mod traits;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
