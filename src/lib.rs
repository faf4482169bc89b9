//! action-debug library
//!
//! Runs a remote serverless action locally with live reload:
//! - Source resolution and bundling of the action's local dependencies
//! - A Docker sandbox whose mounted payload is swapped atomically on change
//! - A relay client that claims remote invocations and reports their results
//! - The debugger state machine tying these together

pub mod builder;
pub mod config;
pub mod container;
pub mod debugger;
pub mod error;
pub mod interception;
pub mod invocation;
pub mod relay;
pub mod source;
pub mod transport;
pub mod watcher;
