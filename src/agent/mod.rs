/// The long-running enforcement agent
///
/// Ties the engine to the outside world: the periodic accounting loop, the
/// inbound command channel and the file-based request drop directory.

pub mod commands;
pub mod daemon;
pub mod requests;

pub use commands::{Command, CommandChannel};
pub use daemon::{Agent, run_agent};
pub use requests::{FileRequest, RequestChannel};
