use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bitfield::{Bitfield, BitfieldError};

/// Describes the target file and how it splits into pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl FileMeta {
    pub fn new(file_name: impl Into<String>, file_size: u64, piece_size: u64) -> Self {
        FileMeta {
            file_name: file_name.into(),
            file_size,
            piece_size,
        }
    }

    pub fn num_pieces(&self) -> usize {
        ((self.file_size + self.piece_size - 1) / self.piece_size) as usize
    }

    /// Exact length of piece `index`; only the last piece may be shorter.
    /// An out-of-range index is a programmer bug.
    pub fn piece_len(&self, index: usize) -> usize {
        assert!(
            index < self.num_pieces(),
            "piece index {} out of range for {} pieces",
            index,
            self.num_pieces()
        );
        let start = index as u64 * self.piece_size;
        let end = (start + self.piece_size).min(self.file_size);
        (end - start) as usize
    }
}

/// Owns the on-disk backing file and the local presence bitfield for one peer.
/// The file lives at `<workdir>/peer_<id>/<file_name>` and is always exactly
/// `file_size` bytes.
pub struct PieceStore {
    meta: FileMeta,
    data_path: PathBuf,
    file: File,
    have: Bitfield,
}

impl PieceStore {
    pub fn new(
        workdir: &Path,
        peer_id: u32,
        meta: FileMeta,
        has_complete_file: bool,
    ) -> Result<Self, StorageError> {
        let peer_dir = workdir.join(format!("peer_{}", peer_id));
        std::fs::create_dir_all(&peer_dir)?;
        let data_path = peer_dir.join(&meta.file_name);

        let source = workdir.join(&meta.file_name);
        if has_complete_file && source.exists() {
            std::fs::copy(&source, &data_path)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;
        file.set_len(meta.file_size)?;

        let mut have = Bitfield::new(meta.num_pieces());
        if has_complete_file {
            for index in 0..meta.num_pieces() {
                have.set(index).expect("index in range by construction");
            }
        }

        Ok(PieceStore {
            meta,
            data_path,
            file,
            have,
        })
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Tolerant of out-of-range indices, mirroring `Bitfield::has`.
    pub fn has_piece(&self, index: usize) -> bool {
        self.have.has(index)
    }

    pub fn count_have(&self) -> usize {
        self.have.count_set()
    }

    pub fn is_complete(&self) -> bool {
        self.have.all_set()
    }

    /// Defensive copy suitable for the BITFIELD payload.
    pub fn raw_bitfield(&self) -> Vec<u8> {
        self.have.to_bytes()
    }

    /// Indices not yet held, ascending. Piece selection walks this.
    pub fn missing_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.have.missing()
    }

    pub fn read_piece(&mut self, index: usize) -> Result<Vec<u8>, StorageError> {
        let expected = self.meta.piece_len(index);
        let mut data = vec![0u8; expected];
        self.file
            .seek(SeekFrom::Start(index as u64 * self.meta.piece_size))?;
        let mut filled = 0;
        while filled < expected {
            let n = self.file.read(&mut data[filled..])?;
            if n == 0 {
                return Err(StorageError::ShortRead {
                    index,
                    expected,
                    actual: filled,
                });
            }
            filled += n;
        }
        Ok(data)
    }

    /// Writes piece `index` and marks it present. The bit is only flipped
    /// after the bytes hit the file, so a failed write never corrupts the
    /// bitfield. Rewriting the same piece is a no-op on the bit.
    pub fn write_piece(&mut self, index: usize, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.meta.piece_len(index);
        if data.len() != expected {
            return Err(StorageError::WrongPieceSize {
                index,
                expected,
                actual: data.len(),
            });
        }
        self.file
            .seek(SeekFrom::Start(index as u64 * self.meta.piece_size))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        self.have.set(index)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Wrong size for piece {index}: expected {expected} bytes, got {actual}.")]
    WrongPieceSize {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Short read for piece {index}: expected {expected} bytes, got {actual}.")]
    ShortRead {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Piece store I/O failed.")]
    Io(#[from] std::io::Error),
    #[error("Piece store bitfield rejected the update.")]
    Bitfield(#[from] BitfieldError),
}
