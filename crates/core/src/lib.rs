// Stepline Core - Execution model, ports and batch engines
// NO infrastructure dependencies: storage backings live in adapter crates,
// apart from the in-process `memory` backing

pub mod application;
pub mod domain;
pub mod error;
pub mod memory;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
