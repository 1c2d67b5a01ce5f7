//! A resumable ustar extractor that is fed the archive stream in block-aligned chunks.
//!
//! The chunk boundaries do not have to line up with entries: the data of a single file may be
//! spread over any number of [`Extractor::feed`] calls.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use fs_err as fs;

use crate::header::{self, block_at, is_zero_block, padded_len, Header, Magic, BLOCK_SIZE};
use crate::{EntryKind, ExtractError, FsOp};

/// The payload of per-file PAX headers is written to this file instead of being interpreted.
pub const PAX_SENTINEL: &str = ".pax_ignore";

/// Extracts the entries of a tar stream into a destination directory.
///
/// ```rust,no_run
/// # use std::path::Path;
/// # fn chunks() -> Vec<Vec<u8>> { Vec::new() }
/// let mut extractor = ustar_unpack::Extractor::begin(Path::new("/tmp/out")).unwrap();
/// for chunk in chunks() {
///     extractor.feed(&chunk).unwrap();
/// }
/// extractor.end().unwrap();
/// ```
pub struct Extractor {
    destination: PathBuf,
    atime: FileTime,
    state: State,
    position: u64,
    entries: usize,
    created_dirs: CreatedDirectories,
    /// Symlinks created by this extraction. Later entries may not be placed below them.
    symlinks: HashSet<PathBuf>,
}

enum State {
    /// The next block is a header or the end-of-archive marker.
    ScanningHeader,
    /// The next bytes belong to a file that is being written.
    CopyingData(PendingFile),
    /// The end-of-archive marker was seen, everything after it is ignored.
    Finished,
}

struct PendingFile {
    file: fs::File,
    path: PathBuf,
    remaining: u64,
    mtime: FileTime,
}

impl PendingFile {
    fn write(&mut self, data: &[u8]) -> Result<(), ExtractError> {
        // `write_all` retries writes interrupted by a signal.
        self.file
            .write_all(data)
            .map_err(ExtractError::fs(FsOp::Write, &self.path))
    }

    fn complete(self, atime: FileTime) -> Result<(), ExtractError> {
        filetime::set_file_handle_times(self.file.file(), Some(atime), Some(self.mtime))
            .map_err(ExtractError::fs(FsOp::SetTimes, &self.path))
    }
}

impl Extractor {
    /// Starts a new extraction into `destination`. The current time becomes the access time of
    /// every extracted file.
    pub fn begin(destination: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(ExtractError::ClockUnavailable)?;
        let destination = destination.into();

        Ok(Self {
            atime: FileTime::from_unix_time(now.as_secs() as i64, now.subsec_nanos()),
            state: State::ScanningHeader,
            position: 0,
            entries: 0,
            created_dirs: CreatedDirectories::new(destination.clone()),
            symlinks: HashSet::new(),
            destination,
        })
    }

    /// Processes the next chunk of the archive stream. The length of `chunk` must be a positive
    /// multiple of [`BLOCK_SIZE`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ExtractError> {
        if chunk.is_empty() || chunk.len() % BLOCK_SIZE != 0 {
            return Err(ExtractError::ChunkNotBlockAligned(chunk.len()));
        }
        tracing::trace!(
            "feeding {} bytes at archive offset {}",
            chunk.len(),
            self.position
        );

        let mut offset = 0;
        while offset < chunk.len() {
            match std::mem::replace(&mut self.state, State::ScanningHeader) {
                State::Finished => {
                    self.state = State::Finished;
                    break;
                }
                State::ScanningHeader => {
                    let block = block_at(chunk, offset).ok_or(ExtractError::TruncatedArchive {
                        len: chunk.len() - offset,
                    })?;
                    if is_zero_block(block) {
                        // A single zero block is treated as the end of the archive.
                        tracing::debug!("end of archive at offset {}", self.position);
                        self.state = State::Finished;
                        break;
                    }
                    self.state = self.interpret_header(block)?;
                    offset += BLOCK_SIZE;
                    self.position += BLOCK_SIZE as u64;
                }
                State::CopyingData(mut pending) => {
                    let available = &chunk[offset..];
                    if pending.remaining <= available.len() as u64 {
                        let len = pending.remaining as usize;
                        pending.write(&available[..len])?;
                        pending.complete(self.atime)?;

                        let skip = (padded_len(len as u64) as usize).min(available.len());
                        offset += skip;
                        self.position += skip as u64;
                    } else {
                        pending.write(available)?;
                        pending.remaining -= available.len() as u64;
                        offset = chunk.len();
                        self.position += available.len() as u64;
                        self.state = State::CopyingData(pending);
                    }
                }
            }
        }

        Ok(())
    }

    /// Finishes the extraction. Fails with [`ExtractError::TruncatedEntry`] if the stream ended
    /// while the data of a file was still expected.
    pub fn end(self) -> Result<(), ExtractError> {
        match self.state {
            State::CopyingData(pending) => Err(ExtractError::TruncatedEntry {
                path: pending.path,
                missing: pending.remaining,
            }),
            State::ScanningHeader => {
                if self.entries > 0 {
                    tracing::warn!("the archive has no end-of-archive marker");
                }
                Ok(())
            }
            State::Finished => Ok(()),
        }
    }

    /// Returns true once the end-of-archive marker has been seen.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    /// Returns the number of headers interpreted so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    fn interpret_header(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<State, ExtractError> {
        let header = Header::parse(block).ok_or(ExtractError::InvalidHeader {
            offset: self.position,
        })?;
        let name = header.path();
        let kind = header
            .entry_kind()
            .ok_or_else(|| ExtractError::UnknownEntryType {
                type_flag: header.type_flag(),
                path: name.clone(),
            })?;

        if self.entries == 0 && header.magic() != Some(Magic::Ustar) {
            tracing::warn!("not a POSIX ustar archive");
        }
        self.entries += 1;
        tracing::debug!("extracting {kind} {}", name.display());

        match kind {
            EntryKind::Directory => {
                self.create_directory(&header, &name)?;
                Ok(State::ScanningHeader)
            }
            EntryKind::Symlink => {
                self.create_symlink(&header, &name)?;
                Ok(State::ScanningHeader)
            }
            // The metadata records are not interpreted, only parked in a fixed file.
            EntryKind::PaxPerFileHeader => self.open_regular(&header, Path::new(PAX_SENTINEL)),
            EntryKind::Regular | EntryKind::Normal | EntryKind::PaxGlobalHeader => {
                self.open_regular(&header, &name)
            }
            EntryKind::HardLink
            | EntryKind::CharDevice
            | EntryKind::BlockDevice
            | EntryKind::Fifo
            | EntryKind::Contiguous => Err(ExtractError::UnsupportedEntryKind { kind, path: name }),
        }
    }

    fn create_directory(&mut self, header: &Header<'_>, name: &Path) -> Result<(), ExtractError> {
        let path = self.target_path(name)?;
        let mode = numeric_field(header.mode(), "mode", name)?;

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        std::os::unix::fs::DirBuilderExt::mode(&mut builder, mode);
        #[cfg(not(unix))]
        let _ = mode;

        self.remove_earlier_symlink(&path)?;
        match builder.create(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(ExtractError::fs(FsOp::CreateDirectory, path)(e)),
        }
        self.created_dirs.insert(path);
        Ok(())
    }

    fn create_symlink(&mut self, header: &Header<'_>, name: &Path) -> Result<(), ExtractError> {
        let path = self.target_path(name)?;

        #[cfg(unix)]
        {
            let target = header::bytes_to_path(header.link_name());
            match fs::os::unix::fs::symlink(&target, &path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    fs::remove_file(&path).map_err(ExtractError::fs(FsOp::Remove, &path))?;
                    fs::os::unix::fs::symlink(&target, &path)
                        .map_err(ExtractError::fs(FsOp::CreateSymlink, &path))?;
                }
                Err(e) => return Err(ExtractError::fs(FsOp::CreateSymlink, path)(e)),
            }
            self.symlinks.insert(path);
        }

        #[cfg(not(unix))]
        {
            let _ = header;
            tracing::warn!("skipping symlink {}", path.display());
        }

        Ok(())
    }

    /// Creates the output file for regular files and PAX headers alike.
    fn open_regular(&mut self, header: &Header<'_>, name: &Path) -> Result<State, ExtractError> {
        let path = self.target_path(name)?;
        let size = numeric_field(header.size(), "size", name)?;
        let mode = numeric_field(header.mode(), "mode", name)?;
        let mtime = numeric_field(header.mtime(), "mtime", name)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        fs::os::unix::fs::OpenOptionsExt::mode(&mut options, mode);
        #[cfg(not(unix))]
        let _ = mode;

        self.remove_earlier_symlink(&path)?;
        let file = options
            .open(&path)
            .map_err(ExtractError::fs(FsOp::CreateFile, &path))?;
        let pending = PendingFile {
            file,
            path,
            remaining: size,
            mtime: FileTime::from_unix_time(i64::try_from(mtime).unwrap_or(i64::MAX), 0),
        };

        if size == 0 {
            pending.complete(self.atime)?;
            return Ok(State::ScanningHeader);
        }

        // Reserve the full length up front, the data follows in later blocks.
        pending
            .file
            .set_len(size)
            .map_err(ExtractError::fs(FsOp::Truncate, &pending.path))?;
        Ok(State::CopyingData(pending))
    }

    /// Maps an archive path into the destination and makes sure its parent directory exists.
    /// Paths below a symlink extracted earlier in this archive are rejected.
    fn target_path(&mut self, name: &Path) -> Result<PathBuf, ExtractError> {
        let path = self.destination.join(normalize_archive_path(name)?);
        if path
            .ancestors()
            .skip(1)
            .any(|ancestor| self.symlinks.contains(ancestor))
        {
            return Err(ExtractError::PathTraversal(name.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            self.created_dirs.create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// An entry that replaces a symlink from this archive replaces the link itself instead of
    /// writing through it.
    fn remove_earlier_symlink(&mut self, path: &Path) -> Result<(), ExtractError> {
        if self.symlinks.remove(path) {
            fs::remove_file(path).map_err(ExtractError::fs(FsOp::Remove, path))?;
        }
        Ok(())
    }
}

fn numeric_field<T>(value: Option<T>, field: &'static str, name: &Path) -> Result<T, ExtractError> {
    value.ok_or_else(|| ExtractError::InvalidNumericField {
        field,
        path: name.to_path_buf(),
    })
}

/// Strips components of an archive path that have no meaning inside the destination (`/`, `.`)
/// and rejects `..`.
fn normalize_archive_path(path: &Path) -> Result<PathBuf, ExtractError> {
    let mut result = PathBuf::with_capacity(path.as_os_str().len());
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return Err(ExtractError::PathTraversal(path.to_path_buf())),
            Component::Normal(part) => result.push(part),
        }
    }
    Ok(result)
}

/// Memoizes directory creation so parents are only created once per extraction.
struct CreatedDirectories {
    created: HashSet<PathBuf>,
}

impl CreatedDirectories {
    fn new(root: PathBuf) -> Self {
        Self {
            created: HashSet::from_iter([root]),
        }
    }

    fn insert(&mut self, path: PathBuf) {
        self.created.insert(path);
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<(), ExtractError> {
        if path.as_os_str().is_empty() || !self.created.insert(path.to_path_buf()) {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }

        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(ExtractError::fs(FsOp::CreateDirectory, path)(e)),
        }
    }
}
