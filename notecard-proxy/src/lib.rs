//! HTTP bridge to a Blues Notecard.
//!
//! Accepts JSON requests over HTTP and forwards each one as a transaction to
//! a Notecard attached over serial or I2C, returning the Notecard's reply
//! unchanged.
//!
//! - [`config`] resolves the transport from the environment.
//! - [`notecard`] opens the device channel and speaks the wire protocols.
//! - [`proxy`] serializes transactions on the single channel.
//! - [`api`] exposes the proxy over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod notecard;
pub mod proxy;
pub mod tracing;
