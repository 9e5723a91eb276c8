// Launching and operating jobs

pub mod exit_code;
pub mod launcher;
pub mod operator;
pub mod registry;

pub use exit_code::{ExitCodeMapper, SimpleExitCodeMapper};
pub use launcher::{JobHandle, JobLauncher, LauncherConfig};
pub use operator::JobOperator;
pub use registry::JobRegistry;
