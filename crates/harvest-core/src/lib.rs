pub mod cancel;
pub mod command;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::CancelSignal;
pub use command::{CommandOutput, CommandRunner};
pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use types::*;
