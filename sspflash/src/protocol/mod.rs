//! Protocol implementations.

pub mod crc;
pub mod ssp;
pub mod transport;

// Re-export common types
pub use ssp::{CommandChannel, SspChannel, SspCommand, SspStatus, parse_address};
pub use transport::{ChunkedTransport, xor_checksum};
