//! On-disk cache entry format.
//!
//! ```text
//! [4]  magic            b"KLN\0"
//! [4]  format version   u32
//! [4]  word size        u32 (usize::BITS of the writer)
//! [4]  fragment count   u32
//! [8]  options length   u64
//! [8]  payload length   u64
//! [L]  build options
//! N x ([8] fragment length, [Fi] fragment bytes)
//! [P]  payload
//! ```
//!
//! All integers use host byte order and there is no padding. A reader verifies
//! every header field, the options, and every fragment byte for byte against the
//! request before returning the payload.

use crate::error::{CacheError, Result};
use crate::fingerprint::Fragment;
use crate::lock::LockedFile;
use crate::util::{bincode_deserialize, bincode_serialize, remove_file_best_effort};
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const ENTRY_MAGIC: [u8; 4] = *b"KLN\0";
pub const ENTRY_HEADER_LEN: usize = 32;

const LENGTH_PREFIX_LEN: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub word_bits: u32,
    pub fragment_count: u32,
    pub options_len: u64,
    pub payload_len: u64,
}

impl EntryHeader {
    pub fn new(
        format_version: u32,
        fragments: &[Fragment<'_>],
        options: &str,
        payload: &[u8],
    ) -> Result<Self> {
        let fragment_count =
            u32::try_from(fragments.len()).map_err(|_| CacheError::UnsupportedRequest {
                reason: format!("{} fragments exceed the entry format limit", fragments.len()),
            })?;
        Ok(Self {
            magic: ENTRY_MAGIC,
            format_version,
            word_bits: usize::BITS,
            fragment_count,
            options_len: options.len() as u64,
            payload_len: payload.len() as u64,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode_serialize(self)?;
        debug_assert_eq!(bytes.len(), ENTRY_HEADER_LEN);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8; ENTRY_HEADER_LEN]) -> Result<Self> {
        bincode_deserialize(bytes)
    }
}

/// What a lookup must match: the cache's format version plus the request.
#[derive(Clone, Copy, Debug)]
pub struct EntryRequest<'a> {
    pub format_version: u32,
    pub fragments: &'a [Fragment<'a>],
    pub options: &'a str,
}

/// Total size of an entry file for the given request and payload.
pub fn entry_len(fragments: &[Fragment<'_>], options: &str, payload: &[u8]) -> u64 {
    let fragment_bytes: u64 = fragments
        .iter()
        .map(|fragment| LENGTH_PREFIX_LEN + fragment.len() as u64)
        .sum();
    ENTRY_HEADER_LEN as u64 + options.len() as u64 + fragment_bytes + payload.len() as u64
}

/// Serialize a complete entry to `out`, returning the number of bytes written.
pub(crate) fn write_entry<W: Write>(
    out: &mut W,
    header: &[u8],
    options: &str,
    fragments: &[Fragment<'_>],
    payload: &[u8],
) -> io::Result<u64> {
    out.write_all(header)?;
    out.write_all(options.as_bytes())?;
    let mut written = header.len() as u64 + options.len() as u64;
    for fragment in fragments {
        out.write_all(&(fragment.len() as u64).to_ne_bytes())?;
        out.write_all(fragment.data())?;
        written += LENGTH_PREFIX_LEN + fragment.len() as u64;
    }
    out.write_all(payload)?;
    Ok(written + payload.len() as u64)
}

/// Write an entry for `request` + `payload` at `path`.
///
/// The file is held under an exclusive lock for the whole write. Any failure
/// removes the file so a later lookup never sees a partial entry.
pub(crate) fn store_entry(path: &Path, request: &EntryRequest<'_>, payload: &[u8]) -> Result<u64> {
    let header = EntryHeader::new(
        request.format_version,
        request.fragments,
        request.options,
        payload,
    )?
    .encode()?;
    store_entry_with(path, |out| {
        write_entry(out, &header, request.options, request.fragments, payload)
    })
}

/// Run `write` against `path` under an exclusive lock.
///
/// The partial file is removed before the lock is released, so a writer queued
/// behind a failed one always starts from a fresh file.
pub(crate) fn store_entry_with(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<&mut LockedFile>) -> io::Result<u64>,
) -> Result<u64> {
    let mut locked = LockedFile::open_exclusive(path)?;
    let result = (|| -> Result<u64> {
        locked.truncate()?;
        let mut out = BufWriter::new(&mut locked);
        let written = write(&mut out)
            .map_err(|err| CacheError::io("writing cache entry", path, err))?;
        out.into_inner()
            .map_err(|err| CacheError::io("writing cache entry", path, err.into_error()))?;
        locked.sync()?;
        locked.harden()?;
        Ok(written)
    })();

    if result.is_err() && !remove_file_best_effort(locked.path(), "store_entry.partial_write") {
        drop(locked);
        remove_file_best_effort(path, "store_entry.partial_write_retry");
    }
    result
}

/// Read the entry at `path` and return its payload if it answers `request`.
///
/// A missing file is `Ok(None)`. An entry written for a different request or
/// configuration is [`CacheError::FormatMismatch`]; one whose declared sizes do
/// not match its length is [`CacheError::CorruptEntry`].
pub(crate) fn load_entry(path: &Path, request: &EntryRequest<'_>) -> Result<Option<Vec<u8>>> {
    let Some(mut locked) = LockedFile::open_shared(path)? else {
        return Ok(None);
    };
    let file_len = locked.len()?;
    let mut reader = EntryReader {
        inner: BufReader::new(&mut locked),
        path,
        remaining: file_len,
    };

    let mut header_bytes = [0u8; ENTRY_HEADER_LEN];
    reader.read_into(&mut header_bytes, "header")?;
    let header = EntryHeader::decode(&header_bytes)
        .map_err(|err| CacheError::corrupt(path, format!("unreadable header: {err}")))?;
    verify_header(path, &header, request)?;

    if header.options_len != request.options.len() as u64 {
        return Err(CacheError::mismatch(
            path,
            format!(
                "options length {} differs from requested {}",
                header.options_len,
                request.options.len()
            ),
        ));
    }
    let stored_options = reader.read_vec(header.options_len, "build options")?;
    if stored_options != request.options.as_bytes() {
        return Err(CacheError::mismatch(path, "build options differ"));
    }

    for (index, fragment) in request.fragments.iter().enumerate() {
        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN as usize];
        reader.read_into(&mut len_bytes, "fragment length")?;
        let stored_len = u64::from_ne_bytes(len_bytes);
        if stored_len != fragment.len() as u64 {
            return Err(CacheError::mismatch(
                path,
                format!(
                    "fragment {index} {:?} length {stored_len} differs from requested {}",
                    fragment.label(),
                    fragment.len()
                ),
            ));
        }
        let stored = reader.read_vec(stored_len, "fragment")?;
        if stored != fragment.data() {
            return Err(CacheError::mismatch(
                path,
                format!("fragment {index} {:?} content differs", fragment.label()),
            ));
        }
    }

    if header.payload_len != reader.remaining {
        return Err(CacheError::corrupt(
            path,
            format!(
                "payload declares {} bytes but {} remain",
                header.payload_len, reader.remaining
            ),
        ));
    }
    let payload = reader.read_vec(header.payload_len, "payload")?;
    Ok(Some(payload))
}

fn verify_header(path: &Path, header: &EntryHeader, request: &EntryRequest<'_>) -> Result<()> {
    if header.magic != ENTRY_MAGIC {
        return Err(CacheError::mismatch(
            path,
            format!("unknown magic tag {:02x?}", header.magic),
        ));
    }
    if header.format_version != request.format_version {
        return Err(CacheError::mismatch(
            path,
            format!(
                "format version {} differs from expected {}",
                header.format_version, request.format_version
            ),
        ));
    }
    if header.word_bits != usize::BITS {
        return Err(CacheError::mismatch(
            path,
            format!(
                "written by a {}-bit process, this one is {}-bit",
                header.word_bits,
                usize::BITS
            ),
        ));
    }
    if header.fragment_count as usize != request.fragments.len() {
        return Err(CacheError::mismatch(
            path,
            format!(
                "fragment count {} differs from requested {}",
                header.fragment_count,
                request.fragments.len()
            ),
        ));
    }
    Ok(())
}

/// Reads sections of an entry while tracking how many bytes the file has left,
/// so a bogus declared length is rejected before anything is allocated for it.
struct EntryReader<'p, R> {
    inner: R,
    path: &'p Path,
    remaining: u64,
}

impl<R: Read> EntryReader<'_, R> {
    fn reserve(&mut self, len: u64, what: &str) -> Result<()> {
        if len > self.remaining {
            return Err(CacheError::corrupt(
                self.path,
                format!("{what} declares {len} bytes but only {} remain", self.remaining),
            ));
        }
        self.remaining -= len;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.reserve(buf.len() as u64, what)?;
        self.fill(buf, what)
    }

    fn read_vec(&mut self, len: u64, what: &str) -> Result<Vec<u8>> {
        self.reserve(len, what)?;
        let len = usize::try_from(len)
            .map_err(|_| CacheError::corrupt(self.path, format!("{what} is too large")))?;
        let mut buf = vec![0u8; len];
        self.fill(&mut buf, what)?;
        Ok(buf)
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.inner.read_exact(buf).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                CacheError::corrupt(self.path, format!("{what} ends early"))
            } else {
                CacheError::io("reading cache entry", self.path, err)
            }
        })
    }
}
