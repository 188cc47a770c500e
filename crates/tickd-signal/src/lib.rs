//! Typed wrapper over the Signal sidecar process.
//!
//! This crate is the only place that shells out to the sidecar; everything
//! else sees parsed [`tickd_core::Message`] values and never the transport.

pub mod adapter;
pub mod envelope;
pub mod error;
pub mod sidecar;

pub use adapter::SignalAdapter;
pub use error::SignalError;
