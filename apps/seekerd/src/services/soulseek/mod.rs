//! Soulseek network integration.
//!
//! The protocol client itself is an external dependency consumed behind the
//! [`client::SoulseekClient`] trait; the [`Supervisor`] owns the single
//! client instance and its lifecycle.

pub mod client;
mod supervisor;

pub use client::{
    ClientEvent, ClientPatch, DisconnectCause, NoopClient, PeerRequestHandler, SoulseekClient,
};
pub use supervisor::Supervisor;
