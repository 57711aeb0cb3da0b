//! Home-automation control plane.
//!
//! A single master places devices on a set of workers; workers load the
//! devices through plugins and report their state.  The two sides only talk
//! over the message bus in [`bus`].

pub mod bus;
pub mod config;
pub mod master;
pub mod plugin;
pub mod scheduler;
pub mod types;
pub mod worker;
