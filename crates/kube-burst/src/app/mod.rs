//! Application module
//!
//! Wires the policy table, the namespace watcher and the pod reconciler
//! together and drives them until shutdown.

pub mod core;
pub mod tasks;

pub use self::core::Application;
