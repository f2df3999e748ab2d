use bit_vec::BitVec;

/// Piece-presence vector. Bit `i` lives in byte `i / 8` at position
/// `7 - i % 8`, which is BitVec's native packing. Spare bits in the last
/// byte stay zero on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Bitfield {
            bits: BitVec::from_elem(num_pieces, false),
        }
    }

    /// Number of bytes a bitfield over `num_pieces` pieces occupies on the wire.
    pub fn packed_len(num_pieces: usize) -> usize {
        (num_pieces + 7) / 8
    }

    /// Out-of-range indices read as absent.
    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.bits.len() {
            return Err(BitfieldError::IndexOutOfRange {
                index,
                num_pieces: self.bits.len(),
            });
        }
        self.bits.set(index, true);
        Ok(())
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().filter(|bit| *bit).count()
    }

    pub fn num_pieces(&self) -> usize {
        self.bits.len()
    }

    pub fn all_set(&self) -> bool {
        self.bits.all()
    }

    /// Indices still absent, in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| !bit)
            .map(|(index, _)| index)
    }

    /// Defensive copy suitable for a BITFIELD payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self, BitfieldError> {
        let expected = Self::packed_len(num_pieces);
        if bytes.len() != expected {
            return Err(BitfieldError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut bits = BitVec::from_bytes(bytes);
        bits.truncate(num_pieces);
        Ok(Bitfield { bits })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("piece index {index} out of range for {num_pieces} pieces")]
    IndexOutOfRange { index: usize, num_pieces: usize },
    #[error("bitfield payload of {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}
