use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_ENTRY;
use crate::model::Event;

/// Write one entry as `[len][bincode][crc32]`.
fn write_entry(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_ENTRY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL entry of {} bytes over {MAX_WAL_ENTRY}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` or report a clean end of log. A short read counts as end of log.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next valid entry. `None` at end of log, on a torn tail, or at
/// the first entry whose CRC or payload does not check out.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_ENTRY {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
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
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only write-ahead log of store mutations.
///
/// Entry format: `[u32 len][bincode Event][u32 crc32]`, little endian, where
/// `len` covers the payload only. A torn final entry from a crash is dropped
/// on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an entry. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_entry(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted log next to `path`. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            write_entry(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// All valid events in `path`, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_entry(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, ReservationRequest};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn stored(time_slot: &str) -> Event {
        Event::ReservationStored {
            reservation: Reservation::new(
                Ulid::new(),
                &ReservationRequest::new("court-1", "2024-05-01", time_slot, "userA"),
                1,
            )
            .unwrap(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let id = Ulid::new();
        let events = vec![
            Event::SlotClaimed { slot_key: "slot:a".into(), id },
            stored("10:00"),
            Event::SlotReleased { slot_key: "slot:a".into(), id },
            Event::ReservationRemoved { id },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = stored("10:00");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::SlotReleased { slot_key: "slot:a".into(), id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&stored("11:00")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = tmp_path("oversized_len.wal");
        let good = stored("10:00");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let keep = stored("10:00");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for i in 0..20 {
            let key = format!("slot:{i}");
            let id = Ulid::new();
            wal.append(&Event::SlotClaimed { slot_key: key.clone(), id }).unwrap();
            wal.append(&Event::SlotReleased { slot_key: key, id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let next = stored("11:00");
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, next]);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| stored(&format!("{i}:00"))).collect();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
