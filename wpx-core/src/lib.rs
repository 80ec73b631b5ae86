//! Shared building blocks for running isolated work in worker processes.
//!
//! The coordinator (`wpxd`) and the worker (`wpxw`) both sit on top of these
//! modules: a multiplexed [`connection::ObjectConnection`], a classloader-aware
//! [`payload::PayloadSerializer`], the request/response protocol and the
//! [`receiver::Receiver`] that correlates a single terminal outcome per call.

pub mod address;
pub mod bootstrap;
pub mod codec;
pub mod connection;
pub mod error;
pub mod fork_options;
pub mod frame;
pub mod loader;
pub mod payload;
pub mod protocol;
pub mod receiver;
pub mod request;
pub mod stoppable;
pub mod value;

pub use error::{PayloadError, WorkerError};
