//! Support for talking to image registry servers

mod auth;
mod client;

pub use client::{HttpRegistryClient, RegistryClient};
