//! Payload envelopes and message bodies
//!
//! Every payload travels inside an envelope tagged with its `PayloadKind`.
//! Envelopes and bodies are bincode-encoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::cursor::CursorKind;
use crate::capture::types::{DisplayInfo, Rect, Rotation};
use crate::error::{ProtocolError, ProtocolResult};

/// Payload type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadKind {
    /// Host to viewer: one encoded region
    ScreenRegion = 0x01,
    /// Host to viewer: the display set
    DisplayData = 0x02,
    /// Host to viewer: pointer shape changed
    CursorChanged = 0x03,
    /// Viewer to host: select a display
    ChangeDisplays = 0x10,
    /// Viewer to host: request a full frame
    KeyFrameRequest = 0x11,
    /// Either direction: end the connection
    Close = 0xF0,
}

impl PayloadKind {
    /// Stable one-byte code (bound into signatures)
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Envelope sent with `is_signed == false`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedPayload {
    /// Body type
    pub kind: PayloadKind,
    /// bincode-encoded body
    pub payload: Vec<u8>,
}

/// Envelope sent with `is_signed == true`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    /// Body type
    pub kind: PayloadKind,
    /// bincode-encoded body
    pub payload: Vec<u8>,
    /// Signature over the kind code and body
    pub signature: Vec<u8>,
    /// Signer's public key
    pub public_key: Vec<u8>,
}

/// A decoded envelope of either flavour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Unsigned envelope
    Unsigned(UnsignedPayload),
    /// Signed envelope (already verified once dispatched)
    Signed(SignedPayload),
}

impl Envelope {
    /// Decodes the envelope selected by the header's signed flag
    ///
    /// # Errors
    ///
    /// Returns `InvalidEnvelope` if the bytes do not decode
    pub fn decode(is_signed: bool, bytes: &[u8]) -> ProtocolResult<Self> {
        if is_signed {
            Ok(Envelope::Signed(bincode::deserialize(bytes)?))
        } else {
            Ok(Envelope::Unsigned(bincode::deserialize(bytes)?))
        }
    }

    /// Encodes the envelope
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(match self {
            Envelope::Unsigned(inner) => bincode::serialize(inner)?,
            Envelope::Signed(inner) => bincode::serialize(inner)?,
        })
    }

    /// Body type
    pub fn kind(&self) -> PayloadKind {
        match self {
            Envelope::Unsigned(inner) => inner.kind,
            Envelope::Signed(inner) => inner.kind,
        }
    }

    /// Whether the envelope is signed
    pub fn is_signed(&self) -> bool {
        matches!(self, Envelope::Signed(_))
    }

    /// Encoded body bytes
    pub fn body(&self) -> &[u8] {
        match self {
            Envelope::Unsigned(inner) => &inner.payload,
            Envelope::Signed(inner) => &inner.payload,
        }
    }

    /// Decodes the body as `P`, checking the kind
    ///
    /// # Errors
    ///
    /// Returns error on a kind mismatch or undecodable body
    pub fn decode_body<P: Payload>(&self) -> ProtocolResult<P> {
        if self.kind() != P::KIND {
            return Err(ProtocolError::UnexpectedKind {
                expected: format!("{:?}", P::KIND),
                actual: format!("{:?}", self.kind()),
            });
        }
        Ok(bincode::deserialize(self.body())?)
    }
}

/// A message body with a fixed kind
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Kind tag for this body
    const KIND: PayloadKind;

    /// Encodes the body and wraps it in an unsigned envelope
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    fn to_unsigned(&self) -> ProtocolResult<UnsignedPayload> {
        Ok(UnsignedPayload {
            kind: Self::KIND,
            payload: bincode::serialize(self)?,
        })
    }
}

/// One changed region of a display
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRegionDto {
    /// Session this region belongs to
    pub session_id: Uuid,
    /// Left edge in virtual-desktop coordinates
    pub x: i32,
    /// Top edge in virtual-desktop coordinates
    pub y: i32,
    /// Region width
    pub width: i32,
    /// Region height
    pub height: i32,
    /// PNG or JPEG bytes
    pub encoded_image: Vec<u8>,
}

impl std::fmt::Debug for ScreenRegionDto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenRegionDto")
            .field("session_id", &self.session_id)
            .field("area", &self.area())
            .field("encoded_len", &self.encoded_image.len())
            .finish()
    }
}

impl ScreenRegionDto {
    /// Region bounds
    pub fn area(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

impl Payload for ScreenRegionDto {
    const KIND: PayloadKind = PayloadKind::ScreenRegion;
}

/// Wire form of one display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDto {
    /// Stable identifier
    pub device_name: String,
    /// Human readable name
    pub display_name: String,
    /// Bounds in virtual-desktop coordinates
    pub bounds: Rect,
    /// Primary display flag
    pub is_primary: bool,
    /// Orientation
    pub rotation: Rotation,
    /// DPI scale factor
    pub scale_factor: f64,
}

impl From<&DisplayInfo> for DisplayDto {
    fn from(display: &DisplayInfo) -> Self {
        Self {
            device_name: display.device_name.clone(),
            display_name: display.display_name.clone(),
            bounds: display.monitor_area,
            is_primary: display.is_primary,
            rotation: display.rotation,
            scale_factor: display.scale_factor,
        }
    }
}

/// The host's display set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataDto {
    /// Session id
    pub session_id: Uuid,
    /// Every attached display
    pub displays: Vec<DisplayDto>,
}

impl Payload for DisplayDataDto {
    const KIND: PayloadKind = PayloadKind::DisplayData;
}

/// Pointer shape change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorChangedDto {
    /// Session id
    pub session_id: Uuid,
    /// New shape
    pub cursor: CursorKind,
}

impl Payload for CursorChangedDto {
    const KIND: PayloadKind = PayloadKind::CursorChanged;
}

/// Viewer request to stream another display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDisplaysDto {
    /// Session id
    pub session_id: Uuid,
    /// Display to stream
    pub device_name: String,
}

impl Payload for ChangeDisplaysDto {
    const KIND: PayloadKind = PayloadKind::ChangeDisplays;
}

/// Viewer request for a full frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFrameRequestDto {
    /// Session id
    pub session_id: Uuid,
}

impl Payload for KeyFrameRequestDto {
    const KIND: PayloadKind = PayloadKind::KeyFrameRequest;
}

/// Orderly end of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseDto {
    /// Why the sender is closing
    pub reason: String,
}

impl Payload for CloseDto {
    const KIND: PayloadKind = PayloadKind::Close;
}
