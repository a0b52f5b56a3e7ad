mod multiplexer;
mod pipes;
mod socket;

pub use self::multiplexer::{Event, Multiplexer, Readiness};
pub use self::pipes::{splice, Pipe, PipePool, Spliced};
pub use self::socket::{bind_front, connect_backend, raise_nofile_limit, set_chatty, tune_buffers};
