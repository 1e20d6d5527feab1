// src/lib.rs
//! Unattended display runtime: device identity, registration, signed requests,
//! manifest sync over push and poll, and timed playback.
pub mod api;
pub mod canon;
pub mod config;
pub mod error;
pub mod identity;
pub mod player;
pub mod registration;
pub mod runtime;
pub mod signer;
pub mod sse;
pub mod store;
pub mod sync;
pub mod timing;
pub mod types;
pub mod verify;

pub use error::{ErrorClass, RuntimeError, RuntimeResult};
