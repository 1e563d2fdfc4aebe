pub mod server;

pub use crate::server::{router, RelayConfig, RelayState};
