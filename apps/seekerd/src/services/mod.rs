//! Daemon services.

pub mod relay;
pub mod shares;
pub mod soulseek;
pub mod transfers;

pub use relay::{RelayAgent, RelayHub};
pub use shares::ShareService;
pub use soulseek::Supervisor;
pub use transfers::{TransferOrchestrator, TransferStore};
