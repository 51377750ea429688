//! Hostname resolution.
//!
//! A connect job resolves its destination exactly once at creation and
//! then walks the candidate list. The [`Resolve`] trait is the seam:
//! [`GaiResolver`] goes through the system's `getaddrinfo`,
//! [`HickoryResolver`] is fully async, and [`StaticResolver`] pins
//! hostnames to fixed addresses for tests and split-horizon setups.

pub mod gai;
pub mod hickory;
pub mod resolve;

pub use gai::GaiResolver;
pub use hickory::HickoryResolver;
pub use resolve::{order_by_preference, Name, Resolve, Resolving, StaticResolver};
