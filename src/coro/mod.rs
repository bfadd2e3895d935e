//! Execution engine pieces the socket adapter suspends on: a one-shot
//! [`Baton`], cooperative cancellation and a reactor-driven [`block_on`].

mod baton;
mod cancellation;
mod executor;

pub use baton::*;
pub use cancellation::*;
pub use executor::*;
