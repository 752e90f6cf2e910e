// Message module: addresses, payload descriptors and the transport-neutral message

pub mod address;
pub mod types;

pub use address::{Address, AddressError, ADDRESS_LEN};
pub use types::{Message, PayloadKind, PayloadType};
