//! Envspace - cross-process cache of prebuilt environments
//!
//! Keeps a pool of disk-resident spaces, each built from an environment
//! spec, and hands out a matching space to any process that asks. Spaces
//! are reused when the spec matches, rebuilt when idle, and created while
//! the pool has room. Concurrent processes coordinate through file locks.

pub mod allocator;
pub mod audit;
pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod space;

pub use error::{SpaceError, SpaceResult};
