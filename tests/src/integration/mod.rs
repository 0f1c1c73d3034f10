//! Integration scenarios. Each file holds a `#[cfg(test)] mod tests`.

#[cfg(test)]
pub(crate) mod fixtures;

pub mod concurrency;
pub mod delivery;
pub mod recovery;
pub mod request_reply;
pub mod secure_rpc;
