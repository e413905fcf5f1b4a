//! The Piece Store: owns the local bitfield and the piece payloads on disk.
//!
//! While a download is incomplete, each received piece is kept in its own
//! file so that it can be served to other peers before the whole torrent is
//! assembled. Once `local_bitfield == full_bitfield`, the per-piece files
//! are concatenated into the target file and removed.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use crate::{
    byte_count, empty_bitfield, error::*, full_bitfield, Bitfield, PieceIndex,
};

/// Static layout information about the file being shared: piece count,
/// nominal and tail piece lengths.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the file.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    pub last_piece_len: u32,
    /// The total length of the shared file.
    pub file_len: u64,
}

impl StorageInfo {
    pub fn new(file_len: u64, piece_len: u32) -> Self {
        let piece_count =
            ((file_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len = if piece_count == 0 {
            0
        } else {
            file_len - piece_len as u64 * (piece_count - 1) as u64
        };
        Self {
            piece_count,
            piece_len,
            last_piece_len: last_piece_len as u32,
            file_len,
        }
    }

    /// The length in bytes of piece `index`.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }
}

/// Owns the local bitfield and the on-disk piece data for one peer process.
pub struct PieceStore {
    info: StorageInfo,
    /// The per-peer working directory, `peer_<id>/`.
    dir: PathBuf,
    /// The target file's name, as named by `FileName` in `Common.cfg`.
    file_name: String,
    /// Bit `i` set means piece `i` is held locally.
    bitfield: Bitfield,
    full_bitfield: Bitfield,
    /// The number of pieces held locally. Kept in lockstep with
    /// `bitfield`'s popcount.
    pieces_held_count: usize,
}

impl PieceStore {
    /// Creates a piece store for a seed, which already has the whole file
    /// present at `dir/file_name`.
    pub fn new_seed(
        info: StorageInfo,
        dir: PathBuf,
        file_name: String,
    ) -> Result<Self> {
        let path = dir.join(&file_name);
        if !path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "peer is marked as having file but {} is missing",
                    path.display()
                ),
            )));
        }
        Ok(Self {
            bitfield: full_bitfield(info.piece_count),
            full_bitfield: full_bitfield(info.piece_count),
            pieces_held_count: info.piece_count,
            info,
            dir,
            file_name,
        })
    }

    /// Creates a piece store for a leecher, which starts with nothing.
    pub fn new_leecher(
        info: StorageInfo,
        dir: PathBuf,
        file_name: String,
    ) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            bitfield: empty_bitfield(info.piece_count),
            full_bitfield: full_bitfield(info.piece_count),
            pieces_held_count: 0,
            info,
            dir,
            file_name,
        })
    }

    pub fn storage_info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn full_bitfield(&self) -> &Bitfield {
        &self.full_bitfield
    }

    pub fn pieces_held_count(&self) -> usize {
        self.pieces_held_count
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield == self.full_bitfield
    }

    /// Bit `i` of the local bitfield.
    pub fn have(&self, index: PieceIndex) -> bool {
        self.bitfield
            .get(index)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// Returns the bytes of piece `index`. Fails with `MissingPiece` if we
    /// don't have it.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        if !self.have(index) {
            return Err(Error::MissingPiece(index));
        }
        let len = self.info.piece_len(index) as usize;
        let mut buf = vec![0; len];
        if self.is_complete() {
            let mut file = File::open(self.dir.join(&self.file_name))?;
            file.seek(SeekFrom::Start(
                index as u64 * self.info.piece_len as u64,
            ))?;
            file.read_exact(&mut buf)?;
        } else {
            let mut file = File::open(self.partial_piece_path(index))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    /// Persists a received piece, sets its bit, and assembles the final
    /// file if this completes the download. Idempotent: calling this twice
    /// for the same index (e.g. a duplicate, re-requested PIECE) is a
    /// no-op, since the Peer Session already filters these out via
    /// `have()` before calling this, but the store does not rely on that.
    pub fn write_piece(&mut self, index: PieceIndex, bytes: &[u8]) -> Result<()> {
        if index >= self.info.piece_count {
            return Err(Error::InvalidPieceIndex(index));
        }
        if self.have(index) {
            return Ok(());
        }

        let expected_len = self.info.piece_len(index) as usize;
        debug_assert_eq!(bytes.len(), expected_len);

        let mut file = File::create(self.partial_piece_path(index))?;
        file.write_all(bytes)?;

        self.bitfield.set(index, true);
        self.pieces_held_count += 1;

        if self.bitfield == self.full_bitfield {
            self.assemble()?;
        }

        Ok(())
    }

    fn partial_piece_path(&self, index: PieceIndex) -> PathBuf {
        self.dir
            .join(format!("partial_piece_{}_{}", index, self.file_name))
    }

    /// Concatenates all per-piece files, in order, into the target file and
    /// removes the per-piece files.
    fn assemble(&self) -> Result<()> {
        let mut out = File::create(self.dir.join(&self.file_name))?;
        for i in 0..self.info.piece_count {
            let path = self.partial_piece_path(i);
            let mut piece = File::open(&path)?;
            std::io::copy(&mut piece, &mut out)?;
        }
        for i in 0..self.info.piece_count {
            let _ = fs::remove_file(self.partial_piece_path(i));
        }
        Ok(())
    }

    /// `⌈piece_count / 8⌉`, the expected byte length of a BITFIELD payload.
    pub fn bitfield_byte_len(&self) -> usize {
        byte_count(self.info.piece_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("swarmpeer-test-{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn tail_piece_len() {
        let info = StorageInfo::new(1000, 256);
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(0), 256);
        assert_eq!(info.piece_len(3), 232);
    }

    #[test]
    fn leecher_write_and_assemble() {
        let dir = tmp_dir("assemble");
        let info = StorageInfo::new(10, 4);
        let mut store = PieceStore::new_leecher(
            info,
            dir.clone(),
            "out.bin".to_owned(),
        )
        .unwrap();

        assert!(!store.have(0));
        store.write_piece(0, b"abcd").unwrap();
        store.write_piece(1, b"efgh").unwrap();
        assert!(!store.is_complete());
        store.write_piece(2, b"ij").unwrap();
        assert!(store.is_complete());

        let assembled = fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(assembled, b"abcdefghij");
        assert!(!dir.join("partial_piece_0_out.bin").exists());
    }

    #[test]
    fn duplicate_write_is_noop() {
        let dir = tmp_dir("dup");
        let info = StorageInfo::new(4, 4);
        let mut store = PieceStore::new_leecher(
            info,
            dir,
            "out.bin".to_owned(),
        )
        .unwrap();
        store.write_piece(0, b"abcd").unwrap();
        assert_eq!(store.pieces_held_count(), 1);
        store.write_piece(0, b"abcd").unwrap();
        assert_eq!(store.pieces_held_count(), 1);
    }

    #[test]
    fn out_of_range_index_is_rejected_not_panicking() {
        let dir = tmp_dir("oob");
        let info = StorageInfo::new(4, 4);
        let mut store =
            PieceStore::new_leecher(info, dir, "out.bin".to_owned()).unwrap();
        assert!(matches!(
            store.write_piece(5, b"abcd"),
            Err(Error::InvalidPieceIndex(5))
        ));
    }
}
