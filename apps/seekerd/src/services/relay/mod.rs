//! Controller/Agent federation plane.
//!
//! A controller accepts persistent, mutually authenticated channels from
//! agents ([`hub`]); agents hold the actual files and answer file and
//! share-index requests with streamed HTTP multipart uploads ([`agent`]).
//! Requests and responses are bound together by HMAC credentials
//! ([`credential`]) over the frame protocol in [`wire`].

mod agent;
pub mod credential;
mod hub;
pub mod wire;

pub use agent::RelayAgent;
pub use hub::{CompletionGuard, FileIntake, RelayFile, RelayHub};
