mod errors;
mod addr;

pub use self::errors::{Error, ErrorKind, Result};
pub use self::addr::parse_addr;
