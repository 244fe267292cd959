//! Sequential tar archive access with direction checking.
//!
//! A [`TarStream`] is either write-only or read-only for its lifetime.
//! Two record kinds exist: named metadata blobs (JSON descriptors) and
//! file records whose header is derived from a [`FileMetaRecord`]. The
//! cumulative [`TarStream::size`] counts payload bytes only; it is the
//! basis for cube fullness decisions.

use std::io::{self, Read, Write};

use crate::error::{FreezeError, FreezeResult};
use crate::fileinfo::FileMetaRecord;

const BLOCK_SIZE: u64 = 512;

/// A named metadata record read back from an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// The record name from the tar header.
    pub name: String,
    /// The record payload, buffered in full.
    pub data: Vec<u8>,
}

enum Inner<T: Write> {
    Writer(tar::Builder<T>),
    Reader(T),
}

/// Sequential archive writer/reader over POSIX tar.
pub struct TarStream<T: Write> {
    inner: Inner<T>,
    payload_bytes: u64,
}

impl<T: Write> TarStream<T> {
    /// Cumulative payload bytes written, excluding tar headers and padding.
    pub fn size(&self) -> u64 {
        self.payload_bytes
    }

    fn direction(attempted: &'static str, mode: &'static str) -> FreezeError {
        FreezeError::Direction { attempted, mode }
    }
}

impl<W: Write> TarStream<W> {
    /// Creates a write-only stream over `dest`.
    pub fn writer(dest: W) -> Self {
        Self {
            inner: Inner::Writer(tar::Builder::new(dest)),
            payload_bytes: 0,
        }
    }

    /// Writes a metadata record with the given name and verbatim payload.
    /// Returns the payload bytes written.
    pub fn write_metadata(&mut self, name: &str, data: &[u8]) -> FreezeResult<u64> {
        let builder = match &mut self.inner {
            Inner::Writer(builder) => builder,
            Inner::Reader(_) => return Err(Self::direction("write", "read-only")),
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path(name)?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data)?;
        self.payload_bytes += data.len() as u64;
        Ok(data.len() as u64)
    }

    /// Writes a file record whose header is derived from `meta` and whose
    /// payload is streamed from `source`. Returns the payload bytes copied.
    pub fn write_file<R: Read>(&mut self, meta: &FileMetaRecord, source: R) -> FreezeResult<u64> {
        let builder = match &mut self.inner {
            Inner::Writer(builder) => builder,
            Inner::Reader(_) => return Err(Self::direction("write", "read-only")),
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(if meta.is_dir {
            tar::EntryType::Directory
        } else {
            tar::EntryType::Regular
        });
        header.set_path(&meta.name)?;
        header.set_size(meta.size);
        header.set_mode(meta.mode);
        header.set_mtime(meta.mod_time.timestamp().max(0) as u64);
        header.set_cksum();

        let mut source = CountingReader { inner: source, read: 0 };
        builder.append(&header, &mut source)?;
        self.payload_bytes += source.read;
        Ok(source.read)
    }

    /// Finalizes the archive footer (two zero blocks) and returns the
    /// underlying writer.
    pub fn finish(self) -> FreezeResult<W> {
        match self.inner {
            Inner::Writer(builder) => Ok(builder.into_inner()?),
            Inner::Reader(_) => Err(Self::direction("finish", "read-only")),
        }
    }
}

impl<R: Read + Write> TarStream<R> {
    /// Creates a read-only stream over `source`.
    pub fn reader(source: R) -> Self {
        Self {
            inner: Inner::Reader(source),
            payload_bytes: 0,
        }
    }

    /// Reads the next record, returning its name and buffered payload.
    /// Returns `None` once the archive footer is reached.
    pub fn read_metadata(&mut self) -> FreezeResult<Option<MetadataRecord>> {
        let source = match &mut self.inner {
            Inner::Reader(source) => source,
            Inner::Writer(_) => return Err(Self::direction("read", "write-only")),
        };
        let (name, data, size) = {
            let mut archive = tar::Archive::new(&mut *source);
            let mut entries = archive.entries()?;
            let mut entry = match entries.next() {
                Some(entry) => entry?,
                None => return Ok(None),
            };
            let name = entry.path()?.to_string_lossy().into_owned();
            let size = entry.header().size()?;
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data)?;
            (name, data, size)
        };
        skip_padding(source, size)?;
        Ok(Some(MetadataRecord { name, data }))
    }

    /// Reads the next record, streaming its payload into `dest` and
    /// returning the stat from its header. Returns `None` at the footer.
    pub fn read_file<W: Write>(&mut self, dest: &mut W) -> FreezeResult<Option<FileMetaRecord>> {
        let source = match &mut self.inner {
            Inner::Reader(source) => source,
            Inner::Writer(_) => return Err(Self::direction("read", "write-only")),
        };
        let (meta, size) = {
            let mut archive = tar::Archive::new(&mut *source);
            let mut entries = archive.entries()?;
            let mut entry = match entries.next() {
                Some(entry) => entry?,
                None => return Ok(None),
            };
            let header = entry.header();
            let meta = FileMetaRecord {
                name: entry.path()?.to_string_lossy().into_owned(),
                size: header.size()?,
                mode: header.mode()? & 0o7777,
                mod_time: chrono::DateTime::from_timestamp(header.mtime()? as i64, 0)
                    .unwrap_or(chrono::DateTime::UNIX_EPOCH),
                is_dir: header.entry_type().is_dir(),
                sys: None,
            };
            io::copy(&mut entry, dest)?;
            let size = meta.size;
            (meta, size)
        };
        skip_padding(source, size)?;
        Ok(Some(meta))
    }
}

/// Consumes the zero padding that aligns a record payload to the next
/// 512-byte block boundary.
fn skip_padding<R: Read>(source: &mut R, payload: u64) -> io::Result<()> {
    let pad = (BLOCK_SIZE - payload % BLOCK_SIZE) % BLOCK_SIZE;
    if pad > 0 {
        let mut limited = source.take(pad);
        io::copy(&mut limited, &mut io::sink())?;
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn metadata_round_trip() {
        let mut stream = TarStream::writer(Vec::new());
        let n = stream.write_metadata("test", b"{\"k\":1}").unwrap();
        assert_eq!(n, 7);
        assert_eq!(stream.size(), 7);
        let bytes = stream.finish().unwrap();

        let mut stream = TarStream::reader(Cursor::new(bytes));
        let record = stream.read_metadata().unwrap().unwrap();
        assert_eq!(record.name, "test");
        assert_eq!(record.data, b"{\"k\":1}");
        assert!(stream.read_metadata().unwrap().is_none());
    }

    #[test]
    fn file_round_trip_preserves_stat() {
        let meta = FileMetaRecord::synthetic("payload.bin", 5);
        let mut stream = TarStream::writer(Vec::new());
        let n = stream.write_file(&meta, &b"12345"[..]).unwrap();
        assert_eq!(n, 5);
        let bytes = stream.finish().unwrap();

        let mut stream = TarStream::reader(Cursor::new(bytes));
        let mut payload = Vec::new();
        let read = stream.read_file(&mut payload).unwrap().unwrap();
        assert_eq!(read.name, "payload.bin");
        assert_eq!(read.size, 5);
        assert_eq!(read.mode, 0o644);
        assert_eq!(payload, b"12345");
    }

    #[test]
    fn mixed_records_in_sequence() {
        let mut stream = TarStream::writer(Vec::new());
        stream.write_metadata("first", b"aaaa").unwrap();
        let meta = FileMetaRecord::synthetic("blob", 3);
        stream.write_file(&meta, &b"xyz"[..]).unwrap();
        stream.write_metadata("last", b"bb").unwrap();
        assert_eq!(stream.size(), 4 + 3 + 2);
        let bytes = stream.finish().unwrap();

        let mut stream = TarStream::reader(Cursor::new(bytes));
        assert_eq!(stream.read_metadata().unwrap().unwrap().name, "first");
        let mut payload = Vec::new();
        assert_eq!(
            stream.read_file(&mut payload).unwrap().unwrap().name,
            "blob"
        );
        assert_eq!(stream.read_metadata().unwrap().unwrap().name, "last");
        assert!(stream.read_metadata().unwrap().is_none());
    }

    #[test]
    fn size_counts_payload_bytes_only() {
        let mut stream = TarStream::writer(Vec::new());
        stream.write_metadata("m", &[0u8; 100]).unwrap();
        assert_eq!(stream.size(), 100);
        let bytes = stream.finish().unwrap();
        // On disk: header block + padded payload block + footer.
        assert!(bytes.len() as u64 > 100);
    }

    #[test]
    fn reading_a_writer_fails_with_direction_error() {
        let mut stream = TarStream::writer(Cursor::new(Vec::new()));
        match stream.read_metadata() {
            Err(FreezeError::Direction { attempted, mode }) => {
                assert_eq!(attempted, "read");
                assert_eq!(mode, "write-only");
            }
            other => panic!("expected direction error, got {other:?}"),
        }
    }

    #[test]
    fn writing_a_reader_fails_with_direction_error() {
        let mut stream = TarStream::reader(Cursor::new(Vec::new()));
        assert!(matches!(
            stream.write_metadata("x", b"y"),
            Err(FreezeError::Direction { .. })
        ));
        assert!(matches!(
            stream.write_file(&FileMetaRecord::synthetic("x", 0), &b""[..]),
            Err(FreezeError::Direction { .. })
        ));
    }

    #[test]
    fn reader_at_end_of_input_returns_none() {
        let mut stream = TarStream::reader(Cursor::new(Vec::new()));
        assert!(stream.read_metadata().unwrap().is_none());
    }
}
