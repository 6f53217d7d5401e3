//! Wire protocol
//!
//! A message is a fixed [`MessageHeader`] followed by `payload_size` bytes
//! of bincode-encoded envelope. The envelope is an [`UnsignedPayload`] or a
//! [`SignedPayload`] depending on the header flag.

pub mod header;
pub mod messages;

pub use header::{MessageHeader, HEADER_SIZE, MESSAGE_DELIMITER};
pub use messages::{
    ChangeDisplaysDto, CloseDto, CursorChangedDto, DisplayDataDto, DisplayDto, Envelope,
    KeyFrameRequestDto, Payload, PayloadKind, ScreenRegionDto, SignedPayload, UnsignedPayload,
};
