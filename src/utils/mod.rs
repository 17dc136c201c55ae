pub mod error;

pub use error::{CloseReason, JsonRpcError, RelayError};
