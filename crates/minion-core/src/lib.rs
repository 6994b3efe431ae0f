pub mod command;
pub mod protocol;

pub use command::{Command, CommandOutput, OutputStream};
pub use protocol::{Inbound, NewCommandsRequest, ProtocolError};
