#![doc = include_str!("../README.md")]

pub mod coro;
pub mod reactor;
pub mod transport;

mod error;
mod socket;
mod timewheel;

pub use error::*;
pub use reactor::{EventBase, EventBaseConfig};
pub use socket::*;
