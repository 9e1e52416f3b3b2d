use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read the next framed event and its size on disk. `Ok(None)` at a clean
/// end, a torn tail, or the first entry whose checksum or payload does not
/// verify.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let frame_len = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, frame_len)))
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only reservation log.
///
/// A crash mid-write leaves at most one torn entry at the tail. `recover`
/// cuts the log back to its last valid frame before appending again, and a
/// failed batch is cut back to the last fsynced length, so new frames never
/// land behind bytes replay cannot read.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    synced_appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            synced_appends: 0,
        })
    }

    /// Replay the log, drop anything after the last valid frame, and open it
    /// for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::replay_with_len(path)?;
        match OpenOptions::new().write(true).open(path) {
            Ok(file) => {
                let on_disk = file.metadata()?.len();
                if on_disk > valid_len {
                    tracing::warn!(
                        "truncating {} unreadable bytes from the tail of {}",
                        on_disk - valid_len,
                        path.display()
                    );
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((Self::open(path)?, events))
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.synced_appends = self.appends_since_compact;
        Ok(())
    }

    /// Throw away everything written or buffered since the last successful
    /// `flush_sync`, so a failed batch leaves no partial frame behind.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer without writing it.
        drop(stale.into_parts());
        self.writer.get_ref().set_len(self.synced_len)?;
        self.writer.get_ref().sync_all()?;
        self.appends_since_compact = self.synced_appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Rewrite the log as `events`: write a temp file, fsync, rename over
    /// the live log, then reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.synced_appends = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid events on disk, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::replay_with_len(path)?.0)
    }

    /// Valid events plus the byte length of the prefix that holds them.
    fn replay_with_len(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((event, frame_len)) = read_entry(&mut reader)? {
            events.push(event);
            valid_len += frame_len;
        }
        Ok((events, valid_len))
    }
}
