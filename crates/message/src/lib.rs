pub mod address;
pub mod buffer;
pub mod header;
pub mod metadata;

pub use address::{split_address, MalformedAddress};
pub use buffer::{Buffer, FileBuffer, MemoryBuffer};
pub use header::Header;
pub use metadata::{MsgId, MsgMetadata, Protocol};
