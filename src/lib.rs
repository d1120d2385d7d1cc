pub use bridge::{BridgeMessage, ENV_CALLBACK_EXECUTABLE, ENV_DEBUG_TAG, ENV_PACKED_CONTENT};
pub use error::{CageError, CageExit};
pub use executor::{managed_exec, ResourceLimit, ERROR_SEQUENCE};
pub use invoker::{invoke_cloner, InvokeConfig, StreamOutput, StreamSource};
pub use pipe::{make_pipe, make_pipe_close_on_exec, make_pipe_nonblocking, BridgePipes, Pipe};
pub use result::{ExecutedResult, ExecutedStatus};

mod bridge;
mod error;
mod executor;
mod invoker;
mod jail;
mod pipe;
pub mod profile;
mod result;
pub mod utils;
