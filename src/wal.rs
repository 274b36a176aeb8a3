use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// `[len][crc]` framing around each payload.
const FRAME_OVERHEAD: u64 = 8;

/// Encode one commit batch as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per record: `[u32: len][bincode: Vec<Event>][u32: crc32]`.
/// One record holds every event of one commit, so a reservation and its bed claims
/// either all replay or none do.
///
/// The file never holds bytes past the last successful `flush_sync` for long: a failed
/// write or sync is rolled back with `rollback`, and `recover` cuts a torn tail left by
/// a crash. A record that replay would reject can therefore never hide later ones.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Records buffered or written since then.
    unsynced_appends: u64,
    /// Set when a rollback failed; the file tail is unknown, so appends are refused.
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Replay the WAL at `path`, cut off anything after the last intact record, and
    /// open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = read_records(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "WAL {}: dropping {} bytes after the last intact record",
                path.display(),
                meta.len() - valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    /// Append a record and fsync. Tests only; the writer task uses group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing. Durable after the next `flush_sync()`.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        encode_record(&mut self.writer, events)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Throw away everything since the last successful `flush_sync`: buffered bytes
    /// are discarded and the file is truncated back to its synced length.
    ///
    /// If this fails the WAL is poisoned and refuses appends until a compaction
    /// rewrites the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact = self
            .appends_since_compact
            .saturating_sub(self.unsynced_appends);
        self.unsynced_appends = 0;
        let result = self.truncate_to_synced();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // `into_parts` hands back the buffer instead of writing it out on drop.
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_old_file, _discarded) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted state to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        // Catalog and each reservation are already grouped; one record is enough.
        encode_record(&mut writer, events)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_old_file, _discarded) = old.into_parts();
        self.appends_since_compact = 0;
        self.unsynced_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    #[cfg(test)]
    pub fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL, returning the events of every intact record in order.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_records(path).map(|(events, _)| events)
    }
}

/// Events of every intact record, and the byte length of that intact prefix.
/// Reading stops at the first truncated, oversized, corrupt or undecodable record.
fn read_records(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u64::from(u32::from_le_bytes(len_buf));
        if valid_len + FRAME_OVERHEAD + len > file_len {
            tracing::warn!(
                "WAL {}: record of {len} bytes runs past end of file, stopping replay",
                path.display()
            );
            break;
        }

        // Bounded by the file length checked above.
        let mut payload = vec![0u8; len as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!("WAL {}: checksum mismatch, stopping replay", path.display());
            break;
        }

        match bincode::deserialize::<Vec<Event>>(&payload) {
            Ok(batch) => events.extend(batch),
            Err(_) => break,
        }
        valid_len += FRAME_OVERHEAD + len;
    }

    Ok((events, valid_len))
}
