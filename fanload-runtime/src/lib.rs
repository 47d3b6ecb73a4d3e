pub mod runtime;

mod error;
mod registry;
mod server;

pub use crate::error::RuntimeError;
pub use crate::registry::RunStatus;
pub use crate::runtime::FanloadRuntime;
