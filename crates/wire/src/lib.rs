use byteorder::{BigEndian, ByteOrder};

/// Fixed 18-byte ASCII header that opens every handshake frame.
pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";
/// Total handshake frame size: header + 10 reserved zero bytes + 4-byte peer id.
pub const HANDSHAKE_LEN: usize = 32;

const RESERVED_LEN: usize = 10;

pub type WireResult<T> = Result<T, WireError>;

/// Builds the 32-byte handshake frame for `peer_id`.
pub fn encode_handshake(peer_id: u32) -> [u8; HANDSHAKE_LEN] {
    let mut frame = [0u8; HANDSHAKE_LEN];
    frame[..18].copy_from_slice(HANDSHAKE_HEADER);
    BigEndian::write_u32(&mut frame[28..], peer_id);
    frame
}

/// Validates a handshake frame and extracts the remote peer id.
pub fn decode_handshake(data: &[u8]) -> WireResult<u32> {
    if data.len() != HANDSHAKE_LEN {
        return Err(WireError::BadHandshake("frame must be exactly 32 bytes"));
    }
    if &data[..18] != HANDSHAKE_HEADER {
        return Err(WireError::BadHandshake("header mismatch"));
    }
    if data[18..18 + RESERVED_LEN].iter().any(|&b| b != 0) {
        return Err(WireError::BadHandshake("reserved bytes must be zero"));
    }
    Ok(BigEndian::read_u32(&data[28..]))
}

/// One decoded protocol message. The wire framing is a 4-byte big-endian
/// length (counting type byte + payload), one type byte, then the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32),
    Piece { index: u32, data: Vec<u8> },
}

impl Message {
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_) => 6,
            Message::Piece { .. } => 7,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Vec::new()
            }
            Message::Have(index) | Message::Request(index) => index.to_be_bytes().to_vec(),
            Message::Bitfield(bits) => bits.clone(),
            Message::Piece { index, data } => {
                let mut payload = Vec::with_capacity(4 + data.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(data);
                payload
            }
        }
    }

    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(4 + 1 + payload.len());
        frame.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
        frame.push(self.type_id());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decodes one full frame, length prefix included.
    pub fn decode(frame: &[u8]) -> WireResult<Message> {
        if frame.len() < 5 {
            return Err(WireError::ShortFrame {
                needed: 5,
                have: frame.len(),
            });
        }
        let length = BigEndian::read_u32(&frame[..4]) as usize;
        if length == 0 {
            return Err(WireError::ShortFrame { needed: 5, have: 4 });
        }
        if frame.len() < 4 + length {
            return Err(WireError::ShortFrame {
                needed: 4 + length,
                have: frame.len(),
            });
        }
        Message::from_parts(frame[4], &frame[5..4 + length])
    }

    /// Builds a message from an already-split type byte and payload.
    pub fn from_parts(type_id: u8, payload: &[u8]) -> WireResult<Message> {
        match type_id {
            0 => expect_empty("CHOKE", payload).map(|_| Message::Choke),
            1 => expect_empty("UNCHOKE", payload).map(|_| Message::Unchoke),
            2 => expect_empty("INTERESTED", payload).map(|_| Message::Interested),
            3 => expect_empty("NOT_INTERESTED", payload).map(|_| Message::NotInterested),
            4 => expect_index("HAVE", payload).map(Message::Have),
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 => expect_index("REQUEST", payload).map(Message::Request),
            7 => {
                if payload.len() < 4 {
                    return Err(WireError::BadPayload {
                        message: "PIECE",
                        expected: 4,
                        actual: payload.len(),
                    });
                }
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&payload[..4]),
                    data: payload[4..].to_vec(),
                })
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn expect_empty(message: &'static str, payload: &[u8]) -> WireResult<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(WireError::BadPayload {
            message,
            expected: 0,
            actual: payload.len(),
        })
    }
}

fn expect_index(message: &'static str, payload: &[u8]) -> WireResult<u32> {
    if payload.len() != 4 {
        return Err(WireError::BadPayload {
            message,
            expected: 4,
            actual: payload.len(),
        });
    }
    Ok(BigEndian::read_u32(payload))
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Choke => write!(f, "CHOKE"),
            Message::Unchoke => write!(f, "UNCHOKE"),
            Message::Interested => write!(f, "INTERESTED"),
            Message::NotInterested => write!(f, "NOT_INTERESTED"),
            Message::Have(index) => write!(f, "HAVE {}", index),
            Message::Bitfield(bits) => write!(f, "BITFIELD ({} bytes)", bits.len()),
            Message::Request(index) => write!(f, "REQUEST {}", index),
            Message::Piece { index, data } => write!(f, "PIECE {} ({} bytes)", index, data.len()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    BadHandshake(&'static str),
    ShortFrame { needed: usize, have: usize },
    UnknownType(u8),
    BadPayload { message: &'static str, expected: usize, actual: usize },
}

impl std::error::Error for WireError {}
impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BadHandshake(reason) => write!(f, "Bad handshake: {}.", reason),
            WireError::ShortFrame { needed, have } => {
                write!(f, "Frame truncated: needed {} bytes, have {}.", needed, have)
            }
            WireError::UnknownType(id) => write!(f, "Unknown message type {}.", id),
            WireError::BadPayload {
                message,
                expected,
                actual,
            } => write!(
                f,
                "Bad payload for {}: expected {} bytes, got {}.",
                message, expected, actual
            ),
        }
    }
}
