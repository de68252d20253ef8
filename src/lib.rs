//! Network speed measurement against fast.com style test servers.
//!
//! The [`speedtest`] module holds the measuring components and the engine
//! that sequences them; [`fast`] discovers test targets; [`results`] and
//! [`display`] turn a run into something a person or a script can read.

pub mod display;
pub mod errors;
pub mod fast;
pub mod measurements;
pub mod results;
pub mod retry;
pub mod speedtest;
pub mod stats;
