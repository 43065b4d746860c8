pub mod commands;
pub mod device;
pub mod error;
pub mod status;
pub mod telemetry;
pub mod topics;

pub use commands::*;
pub use device::*;
pub use error::*;
pub use status::*;
pub use telemetry::*;
