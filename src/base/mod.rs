//! Base types shared by every layer.
//!
//! - [`neterror::NetError`]: the crate-wide error taxonomy
//! - [`chunks::ChunkList`]: segmented byte buffer used for socket input
//!   and output accumulation

pub mod chunks;
pub mod neterror;

pub use chunks::ChunkList;
pub use neterror::NetError;
