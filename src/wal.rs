use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One committed transaction: every event in it becomes visible together or not at all.
pub type Frame = Vec<Event>;

/// Encode a single frame to [len][bincode][crc32] format. Returns the bytes written.
fn encode_frame(writer: &mut impl Write, frame: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Append-only Write-Ahead Log of committed transaction frames.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated last frame (crash mid-commit) is discarded via length-prefix + CRC
///   check, so a transaction is either fully replayed or not at all.
///
/// Bytes past `synced_len` belong to frames whose commit has not been
/// acknowledged. A failed flush rolls them back so a frame reported as failed
/// can never reappear on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    unsynced_len: u64,
    unsynced_frames: u64,
    /// Set when a rollback itself failed; every later append is refused.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_len: 0,
            unsynced_frames: 0,
            poisoned: false,
        })
    }

    /// Append a single frame and fsync. The store goes through `append_buffered`
    /// and `flush_sync` so concurrent commits share one fsync.
    #[cfg(test)]
    pub fn append(&mut self, frame: &[Event]) -> io::Result<()> {
        self.append_buffered(frame)?;
        self.flush_sync()
    }

    /// Append a frame to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered frames.
    pub fn append_buffered(&mut self, frame: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback"));
        }
        self.unsynced_len += encode_frame(&mut self.writer, frame)?;
        self.unsynced_frames += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_len;
        self.appends_since_compact += self.unsynced_frames;
        self.unsynced_len = 0;
        self.unsynced_frames = 0;
        Ok(())
    }

    /// Throw away every frame appended since the last successful `flush_sync`,
    /// whether it is still buffered or already reached the file. If the file
    /// cannot be cut back the WAL is poisoned.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.unsynced_len = 0;
        self.unsynced_frames = 0;
        let result = self.truncate_to_synced();
        self.poisoned = result.is_err();
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // into_parts hands back the buffer without writing it out.
        let (_, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted snapshot to a temp file and fsync.
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        // The snapshot is chunked so a single frame stays well under u32::MAX.
        for chunk in snapshot.chunks(1024) {
            encode_frame(&mut writer, chunk)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_len = 0;
        self.unsynced_frames = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid frames in commit order.
    /// Truncated/corrupt trailing frames are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Frame>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Frame>(&payload) {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }

        Ok(frames)
    }
}
