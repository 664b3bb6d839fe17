use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Records larger than this are treated as corruption on replay.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf`, or report a clean/torn end of log as `Ok(false)`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next record and its size on disk. `None` at end of log or at
/// the first damaged record.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let record_len = (len + 8) as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, record_len)))
}

/// Intact events and the byte offset just past the last of them.
fn read_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut offset = 0;
    while let Some((event, record_len)) = decode_next(&mut reader)? {
        events.push(event);
        offset += record_len;
    }
    Ok((events, offset))
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Append-only write-ahead log of appointment events.
///
/// A crash can leave a torn last record; replay stops at the first record
/// whose length, checksum or payload does not hold up, and keeps everything
/// before it. [`Wal::recover`] also cuts that tail off so later appends are
/// never written behind it.
///
/// Appends are staged in memory and reach the file only in `flush_sync`,
/// which either makes the whole staged batch durable or rolls the file back
/// to its last durable length.
pub struct Wal {
    file: File,
    staged: Vec<u8>,
    staged_count: u64,
    durable_len: u64,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            staged: Vec::new(),
            staged_count: 0,
            durable_len,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay the log, truncate any damaged tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, intact_len) = read_intact(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > intact_len
        {
            tracing::warn!(
                "truncating {} damaged bytes at the end of {}",
                meta.len() - intact_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok((events, Self::open(path)?))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Append a single event and fsync. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.staged, event)?;
        self.staged_count += 1;
        Ok(())
    }

    /// Write and fsync everything staged. On failure nothing staged survives,
    /// in memory or on disk.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let result = self
            .file
            .write_all(&self.staged)
            .and_then(|()| self.file.sync_all());
        match result {
            Ok(()) => {
                self.durable_len += self.staged.len() as u64;
                self.appends_since_compact += self.staged_count;
                self.discard_staged();
                Ok(())
            }
            Err(e) => {
                self.discard_staged();
                self.rollback();
                Err(e)
            }
        }
    }

    /// Drop staged events without writing them.
    pub fn discard_staged(&mut self) {
        self.staged.clear();
        self.staged_count = 0;
    }

    fn rollback(&mut self) {
        if let Err(e) = self
            .file
            .set_len(self.durable_len)
            .and_then(|()| self.file.sync_all())
        {
            tracing::error!("WAL rollback of {} failed: {e}", self.path.display());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Phase 1 of compaction: write `events` to a temp file next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase 2 of compaction: rename the temp file over the log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        self.file = Self::open_append(&self.path)?;
        self.durable_len = self.file.metadata()?.len();
        self.discard_staged();
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases at once.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in log order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_intact(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn registered(id: Ulid) -> Event {
        Event::ServiceRegistered {
            id,
            provider_id: Ulid::new(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let sid = Ulid::new();
        let aid = Ulid::new();

        let events = vec![
            registered(sid),
            Event::SlotPublished {
                id: aid,
                service_id: sid,
                appointment_date: 1_742_292_000_000,
            },
            Event::SlotClaimed {
                id: aid,
                service_id: sid,
                user_id: Ulid::new(),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = registered(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Append garbage to simulate a torn second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = registered(Ulid::new());
        let bad = registered(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![good]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let sid = Ulid::new();
        let provider_id = Ulid::new();
        let register = Event::ServiceRegistered { id: sid, provider_id };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&register).unwrap();
            for i in 0..10 {
                let aid = Ulid::new();
                wal.append(&Event::SlotPublished {
                    id: aid,
                    service_id: sid,
                    appointment_date: i * 1000,
                })
                .unwrap();
                wal.append(&Event::SlotClaimed {
                    id: aid,
                    service_id: sid,
                    user_id: Ulid::new(),
                })
                .unwrap();
                wal.append(&Event::AppointmentCancelled {
                    id: aid,
                    service_id: sid,
                    by: Role::User,
                })
                .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![register];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let sid = Ulid::new();
        let compacted = vec![registered(sid)];
        let new_event = Event::SlotPublished {
            id: Ulid::new(),
            service_id: sid,
            appointment_date: 5_000,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&new_event).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), new_event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| registered(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discarded_events_never_reach_disk() {
        let path = tmp_path("discarded.wal");
        let kept = registered(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&registered(Ulid::new())).unwrap();
            wal.discard_staged();
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = registered(Ulid::new());
        let second = registered(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        {
            let (events, mut wal) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            wal.append(&second).unwrap();
        }

        let (events, _wal) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_missing_file_starts_empty() {
        let path = tmp_path("recover_missing.wal");
        let (events, wal) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        assert_eq!(wal.appends_since_compact(), 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length_prefix() {
        let path = tmp_path("oversized.wal");
        let good = registered(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);

        let _ = fs::remove_file(&path);
    }
}
