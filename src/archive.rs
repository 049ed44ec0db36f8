//! Depth-first walker over nested archives.
//!
//! Nesting is handled with an explicit stack of frames instead of recursion,
//! one frame per open container. Leaves are never extracted: tar members are
//! read in order straight out of the (decompressed) tar stream, zip members
//! straight out of the zip file. A nested zip is the only thing that needs
//! random access, so its bytes are spilled to a scratch file owned by its
//! frame and removed as soon as the frame is exhausted. Dropping the walker
//! removes whatever scratch space is still alive, whichever way the walk ends.
//!
//! A tar leaf shares its frame's stream: it is readable until the next call
//! to `next`, after which reads fail.

use crate::config::{EXTRACT_BUFFER_SIZE, MAX_ARCHIVE_DEPTH, READ_BUFFER_SIZE};
use bzip2::read::BzDecoder;
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use flate2::CrcReader;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("I/O error on {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl WalkError {
    fn corrupt(path: &str, reason: impl ToString) -> Self {
        WalkError::Corrupt {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    fn io(path: &str, source: io::Error) -> Self {
        WalkError::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Zip,
    Tar(Compression),
    /// A single compressed stream, decoded transparently
    Compressed(Compression),
    Plain,
}

impl EntryKind {
    pub fn of(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            EntryKind::Zip
        } else if lower.ends_with(".tar") {
            EntryKind::Tar(Compression::None)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            EntryKind::Tar(Compression::Gzip)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") || lower.ends_with(".tbz")
        {
            EntryKind::Tar(Compression::Bzip2)
        } else if lower.ends_with(".gz") {
            EntryKind::Compressed(Compression::Gzip)
        } else if lower.ends_with(".bz2") {
            EntryKind::Compressed(Compression::Bzip2)
        } else {
            EntryKind::Plain
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, EntryKind::Zip | EntryKind::Tar(_))
    }
}

fn decompress(reader: Box<dyn Read + Send>, compression: Compression) -> Box<dyn Read + Send> {
    match compression {
        Compression::None => reader,
        Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
    }
}

/// A leaf document: its path relative to the walk root and a decoded stream.
pub struct LeafEntry {
    pub path: String,
    /// Containers above this leaf; 0 means the leaf is the walk root itself
    pub depth: usize,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for LeafEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafEntry")
            .field("path", &self.path)
            .field("depth", &self.depth)
            .finish()
    }
}

impl LeafEntry {
    /// Wraps a raw stream, stripping and decoding a `.gz`/`.bz2` suffix.
    pub fn decode(path: String, depth: usize, reader: Box<dyn Read + Send>) -> Self {
        match EntryKind::of(&path) {
            EntryKind::Compressed(compression) => {
                let suffix = if compression == Compression::Gzip { ".gz" } else { ".bz2" };
                LeafEntry {
                    path: strip_suffix_ci(&path, suffix),
                    depth,
                    reader: decompress(reader, compression),
                }
            }
            _ => LeafEntry {
                path,
                depth,
                reader,
            },
        }
    }
}

fn strip_suffix_ci(path: &str, suffix: &str) -> String {
    let cut = path.len().saturating_sub(suffix.len());
    if path.is_char_boundary(cut) && path[cut..].eq_ignore_ascii_case(suffix) {
        path[..cut].to_string()
    } else {
        path.to_string()
    }
}

/// An inner container or member that could not be read and was passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

enum Step {
    Member {
        name: String,
        reader: Box<dyn Read + Send>,
    },
    /// One member could not be opened; its siblings are still readable
    BadMember { name: String, reason: String },
    Done,
}

enum Members {
    Zip(ZipMembers),
    Tar(TarMembers),
}

impl Members {
    /// `Err` means the container itself is broken and nothing more can be read from it.
    fn advance(&mut self) -> Result<Step, String> {
        match self {
            Members::Zip(zip) => Ok(zip.advance()),
            Members::Tar(tar) => tar.advance().map_err(|e| e.to_string()),
        }
    }
}

struct Frame {
    /// Logical path of the container
    name: String,
    /// Prepended to member names; empty for the walk root
    prefix: String,
    depth: usize,
    members: Members,
}

impl Frame {
    fn join(&self, member: &str) -> String {
        if self.prefix.is_empty() {
            member.to_string()
        } else {
            format!("{}/{}", self.prefix, member)
        }
    }
}

// ---------------------------------------------------------------------------
// Zip
// ---------------------------------------------------------------------------

struct ZipMembers {
    archive: zip::ZipArchive<BufReader<File>>,
    file: PathBuf,
    next: usize,
    // Present when the archive was spilled; dropped with the frame
    _spill: Option<TempDir>,
}

struct ZipMember {
    name: String,
    data_start: u64,
    compressed_size: u64,
    size: u64,
    crc32: u32,
    method: zip::CompressionMethod,
}

impl ZipMembers {
    fn new(file: PathBuf, handle: File, spill: Option<TempDir>) -> Result<Self, String> {
        let archive = zip::ZipArchive::new(BufReader::new(handle)).map_err(|e| e.to_string())?;
        Ok(Self {
            archive,
            file,
            next: 0,
            _spill: spill,
        })
    }

    fn advance(&mut self) -> Step {
        while self.next < self.archive.len() {
            let index = self.next;
            self.next += 1;

            let looked_up = self.archive.by_index_raw(index).map(|entry| {
                if entry.is_dir() {
                    return None;
                }
                let Some(name) = entry.enclosed_name().and_then(|p| safe_entry_name(&p)) else {
                    warn!(entry = entry.name(), "Skipping unsafe entry path");
                    return None;
                };
                Some(ZipMember {
                    name,
                    data_start: entry.data_start(),
                    compressed_size: entry.compressed_size(),
                    size: entry.size(),
                    crc32: entry.crc32(),
                    method: entry.compression(),
                })
            });

            let member = match looked_up {
                Ok(Some(member)) => member,
                Ok(None) => continue,
                Err(e) => {
                    let name = self
                        .archive
                        .name_for_index(index)
                        .map_or_else(|| format!("#{index}"), str::to_string);
                    return Step::BadMember {
                        name,
                        reason: e.to_string(),
                    };
                }
            };

            return match member.open(&self.file) {
                Ok(reader) => Step::Member {
                    name: member.name,
                    reader,
                },
                Err(e) => Step::BadMember {
                    name: member.name,
                    reason: e.to_string(),
                },
            };
        }
        Step::Done
    }
}

impl ZipMember {
    /// Opens the member's data with its own file handle, so the reader
    /// outlives any later lookups on the archive.
    fn open(&self, archive: &Path) -> io::Result<Box<dyn Read + Send>> {
        let mut file = File::open(archive)?;
        file.seek(SeekFrom::Start(self.data_start))?;
        let raw = BufReader::with_capacity(READ_BUFFER_SIZE, file).take(self.compressed_size);
        let decoded: Box<dyn Read + Send> = match self.method {
            zip::CompressionMethod::Stored => Box::new(raw),
            zip::CompressionMethod::Deflated => Box::new(DeflateDecoder::new(raw)),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported compression method {other}"),
                ))
            }
        };
        Ok(Box::new(CheckedMember {
            inner: CrcReader::new(decoded),
            expected_size: self.size,
            expected_crc: self.crc32,
            read: 0,
        }))
    }
}

/// Verifies length and CRC-32 once the member is read to the end.
struct CheckedMember {
    inner: CrcReader<Box<dyn Read + Send>>,
    expected_size: u64,
    expected_crc: u32,
    read: u64,
}

impl Read for CheckedMember {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if n == 0 && !buf.is_empty() {
            if self.read != self.expected_size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("member is {} bytes, expected {}", self.read, self.expected_size),
                ));
            }
            if self.inner.crc().sum() != self.expected_crc {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "member checksum mismatch",
                ));
            }
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tar
// ---------------------------------------------------------------------------

const BLOCK: u64 = 512;

/// GNU long names and PAX records larger than this are treated as corruption
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

struct TarStream {
    reader: Box<dyn Read + Send>,
    /// Bumped each time the walk moves past a member
    generation: u64,
    /// Unread data bytes of the current member
    remaining: u64,
    padding: u64,
}

struct TarMembers {
    stream: Arc<Mutex<TarStream>>,
}

/// Reads the current member straight from the shared tar stream.
struct TarMemberReader {
    stream: Arc<Mutex<TarStream>>,
    generation: u64,
}

impl TarMembers {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            stream: Arc::new(Mutex::new(TarStream {
                reader,
                generation: 0,
                remaining: 0,
                padding: 0,
            })),
        }
    }

    fn advance(&mut self) -> io::Result<Step> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let Some(path) = stream.next_member()? else {
                return Ok(Step::Done);
            };
            match safe_entry_name(&path) {
                Some(name) => {
                    return Ok(Step::Member {
                        name,
                        reader: Box::new(TarMemberReader {
                            stream: Arc::clone(&self.stream),
                            generation: stream.generation,
                        }),
                    })
                }
                None => warn!(entry = %path.display(), "Skipping unsafe entry path"),
            }
        }
    }
}

impl TarStream {
    /// Skips whatever is left of the current member and reads headers up to
    /// the next regular file. `None` at the end of the archive.
    fn next_member(&mut self) -> io::Result<Option<PathBuf>> {
        self.generation += 1;
        let leftover = self.remaining + self.padding;
        self.remaining = 0;
        self.padding = 0;
        self.skip(leftover)?;

        let mut long_name: Option<PathBuf> = None;
        let mut pax_size: Option<u64> = None;
        loop {
            let mut header = tar::Header::new_old();
            if !self.read_block(header.as_mut_bytes())? {
                return Ok(None);
            }
            if header.as_bytes().iter().all(|b| *b == 0) {
                return Ok(None);
            }
            verify_checksum(&header)?;

            let kind = header.entry_type();
            let header_size = header.entry_size()?;
            if kind.is_gnu_longname() {
                let data = self.read_extension(header_size)?;
                let name = data.split(|b| *b == 0).next().unwrap_or_default();
                long_name = Some(PathBuf::from(String::from_utf8_lossy(name).into_owned()));
                continue;
            }
            if kind.is_pax_local_extensions() {
                let data = self.read_extension(header_size)?;
                for ext in tar::PaxExtensions::new(&data).flatten() {
                    match (ext.key(), ext.value()) {
                        (Ok("path"), Ok(value)) => long_name = Some(PathBuf::from(value)),
                        (Ok("size"), Ok(value)) => pax_size = value.parse().ok(),
                        _ => {}
                    }
                }
                continue;
            }

            let size = pax_size.take().unwrap_or(header_size);
            let padding = size.div_ceil(BLOCK) * BLOCK - size;
            if !kind.is_file() {
                self.skip(size + padding)?;
                long_name = None;
                continue;
            }

            let path = match long_name.take() {
                Some(path) => path,
                None => header.path()?.into_owned(),
            };
            self.remaining = size;
            self.padding = padding;
            return Ok(Some(path));
        }
    }

    /// `false` on a clean end of stream at a block boundary.
    fn read_block(&mut self, block: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < block.len() {
            match self.reader.read(&mut block[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "tar stream ends inside a header",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_extension(&mut self, size: u64) -> io::Result<Vec<u8>> {
        if size > MAX_EXTENSION_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tar extension header of {size} bytes"),
            ));
        }
        let mut data = Vec::with_capacity(size as usize);
        self.reader.by_ref().take(size).read_to_end(&mut data)?;
        if (data.len() as u64) < size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar stream ends inside an extension header",
            ));
        }
        self.skip(size.div_ceil(BLOCK) * BLOCK - size)?;
        Ok(data)
    }

    fn skip(&mut self, count: u64) -> io::Result<()> {
        let skipped = io::copy(&mut self.reader.by_ref().take(count), &mut io::sink())?;
        if skipped < count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar stream ends inside a member",
            ));
        }
        Ok(())
    }
}

fn verify_checksum(header: &tar::Header) -> io::Result<()> {
    let bytes = header.as_bytes();
    // The checksum field itself counts as eight spaces
    let sum = bytes[..148]
        .iter()
        .chain(&bytes[156..])
        .map(|b| u32::from(*b))
        .sum::<u32>()
        + 8 * u32::from(b' ');
    if sum == header.cksum()? {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tar header checksum mismatch",
        ))
    }
}

impl Read for TarMemberReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if stream.generation != self.generation {
            return Err(io::Error::other("tar member read after the walk moved past it"));
        }
        if buf.is_empty() || stream.remaining == 0 {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(stream.remaining).unwrap_or(usize::MAX));
        let n = stream.reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar member is truncated",
            ));
        }
        stream.remaining -= n as u64;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

pub struct ArchiveWalker {
    stack: Vec<Frame>,
    pending: Option<LeafEntry>,
    skipped: Vec<SkippedEntry>,
}

impl ArchiveWalker {
    /// Opens a root file. A root that is not a container is walked as a single
    /// leaf. A root zip is read in place; nothing is copied.
    pub fn open(root: &Path) -> Result<Self, WalkError> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        let handle = File::open(root).map_err(|e| WalkError::io(&name, e))?;

        let members = match EntryKind::of(&name) {
            EntryKind::Zip => Members::Zip(
                ZipMembers::new(root.to_path_buf(), handle, None)
                    .map_err(|e| WalkError::corrupt(&name, e))?,
            ),
            EntryKind::Tar(compression) => {
                let reader = BufReader::with_capacity(READ_BUFFER_SIZE, handle);
                Members::Tar(TarMembers::new(decompress(Box::new(reader), compression)))
            }
            EntryKind::Compressed(_) | EntryKind::Plain => {
                let reader = BufReader::with_capacity(READ_BUFFER_SIZE, handle);
                return Ok(Self::single(LeafEntry::decode(name, 0, Box::new(reader))));
            }
        };
        Ok(Self::rooted(name, members))
    }

    /// Walks an already-open stream. A zip needs random access, so a zip
    /// stream is spilled to scratch space first; a tar stream is read as it
    /// arrives.
    pub fn open_stream(name: &str, mut reader: Box<dyn Read + Send>) -> Result<Self, WalkError> {
        let members = match EntryKind::of(name) {
            EntryKind::Zip => {
                let spill = scratch_dir().map_err(|e| WalkError::io(name, e))?;
                let file = spill.path().join("root.zip");
                copy_to(&mut reader, &file).map_err(|e| WalkError::io(name, e))?;
                let handle = File::open(&file).map_err(|e| WalkError::io(name, e))?;
                Members::Zip(
                    ZipMembers::new(file, handle, Some(spill))
                        .map_err(|e| WalkError::corrupt(name, e))?,
                )
            }
            EntryKind::Tar(compression) => Members::Tar(TarMembers::new(decompress(reader, compression))),
            EntryKind::Compressed(_) | EntryKind::Plain => {
                return Ok(Self::single(LeafEntry::decode(name.to_string(), 0, reader)));
            }
        };
        Ok(Self::rooted(name.to_string(), members))
    }

    fn single(leaf: LeafEntry) -> Self {
        Self {
            stack: Vec::new(),
            pending: Some(leaf),
            skipped: Vec::new(),
        }
    }

    fn rooted(name: String, members: Members) -> Self {
        Self {
            stack: vec![Frame {
                name,
                prefix: String::new(),
                depth: 1,
                members,
            }],
            pending: None,
            skipped: Vec::new(),
        }
    }

    /// Inner containers and members that were skipped as corrupt, in walk order.
    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    /// Records an inner entry that could not be read, e.g. a leaf whose
    /// stream broke off part way through.
    pub fn skip_entry(&mut self, path: String, reason: String) {
        warn!(path = %path, reason = %reason, "Skipping corrupt inner entry");
        self.skipped.push(SkippedEntry { path, reason });
    }
}

impl Iterator for ArchiveWalker {
    type Item = Result<LeafEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(leaf) = self.pending.take() {
            return Some(Ok(leaf));
        }

        loop {
            let frame = self.stack.last_mut()?;
            let step = match frame.members.advance() {
                Ok(step) => step,
                Err(reason) => {
                    let broken = self.stack.pop()?;
                    if broken.depth == 1 {
                        return Some(Err(WalkError::corrupt(&broken.name, reason)));
                    }
                    self.skip_entry(broken.name, reason);
                    continue;
                }
            };

            match step {
                Step::Done => {
                    self.stack.pop();
                }
                Step::BadMember { name, reason } => {
                    let path = frame.join(&name);
                    self.skip_entry(path, reason);
                }
                Step::Member { name, reader } => {
                    let depth = frame.depth;
                    let path = frame.join(&name);
                    let kind = EntryKind::of(&name);
                    if !kind.is_container() {
                        return Some(Ok(LeafEntry::decode(path, depth, reader)));
                    }
                    if depth >= MAX_ARCHIVE_DEPTH {
                        self.skip_entry(path, format!("nesting deeper than {MAX_ARCHIVE_DEPTH}"));
                        continue;
                    }
                    match descend(kind, reader) {
                        Ok(members) => {
                            debug!(path = %path, depth = depth + 1, "Entering container");
                            self.stack.push(Frame {
                                name: path.clone(),
                                prefix: path,
                                depth: depth + 1,
                                members,
                            });
                        }
                        Err(reason) => self.skip_entry(path, reason),
                    }
                }
            }
        }
    }
}

/// Opens a nested container read from its parent. Only a zip touches disk.
fn descend(kind: EntryKind, mut reader: Box<dyn Read + Send>) -> Result<Members, String> {
    match kind {
        EntryKind::Tar(compression) => {
            let buffered = BufReader::with_capacity(EXTRACT_BUFFER_SIZE, reader);
            Ok(Members::Tar(TarMembers::new(decompress(Box::new(buffered), compression))))
        }
        EntryKind::Zip => {
            let spill = scratch_dir().map_err(|e| e.to_string())?;
            let file = spill.path().join("member.zip");
            copy_to(&mut reader, &file).map_err(|e| e.to_string())?;
            let handle = File::open(&file).map_err(|e| e.to_string())?;
            ZipMembers::new(file, handle, Some(spill)).map(Members::Zip)
        }
        EntryKind::Compressed(_) | EntryKind::Plain => Err("not a container".to_string()),
    }
}

fn scratch_dir() -> io::Result<TempDir> {
    tempfile::Builder::new().prefix("trawl-").tempdir()
}

fn copy_to(reader: &mut dyn Read, dest: &Path) -> io::Result<u64> {
    let mut writer = BufWriter::with_capacity(EXTRACT_BUFFER_SIZE, File::create(dest)?);
    let n = io::copy(reader, &mut writer)?;
    writer.flush()?;
    Ok(n)
}

/// Archive-relative names that would land outside the archive root are refused.
fn safe_entry_name(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
