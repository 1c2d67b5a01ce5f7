//! Functions that extract an archive held completely in memory.

use std::path::{Path, PathBuf};

use crate::envelope::{looks_compressed, GzipDecoder};
use crate::header::{self, block_at, Header, BLOCK_SIZE};
use crate::{EntryKind, ExtractError, Extractor, FsOp};

/// The amount of decompressed data handed to the extractor at once.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A PAX header, its single payload block and the header of the root directory.
const ROOT_LOOKAHEAD: usize = 3 * BLOCK_SIZE;

/// Options that control an extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// The directory the archive entries are created in.
    pub destination: PathBuf,

    /// The size of the chunks the decompressed stream is processed in. Must be a positive
    /// multiple of [`BLOCK_SIZE`].
    pub chunk_size: usize,
}

impl ExtractOptions {
    /// Options that extract into `destination` with the default chunk size.
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }
}

/// Extracts the archive in `buffer` into `destination` and returns the name of its top-level
/// directory.
///
/// ```rust,no_run
/// # use std::path::Path;
/// let buffer = std::fs::read("source.tar.gz").unwrap();
/// let root = ustar_unpack::read::extract(&buffer, Path::new("/tmp/out")).unwrap();
/// ```
pub fn extract(buffer: &[u8], destination: &Path) -> Result<String, ExtractError> {
    extract_with_options(buffer, &ExtractOptions::new(destination))
}

/// Same as [`extract`] but with explicit [`ExtractOptions`].
pub fn extract_with_options(
    buffer: &[u8],
    options: &ExtractOptions,
) -> Result<String, ExtractError> {
    unpack(buffer, options)?.ok_or(ExtractError::NoDirectoryFound)
}

/// Extracts the archive in `buffer`. Returns `Ok(None)` if the buffer does not hold a tar
/// archive, in which case nothing is written, or if the archive does not start with a directory.
pub fn unpack(buffer: &[u8], options: &ExtractOptions) -> Result<Option<String>, ExtractError> {
    if options.chunk_size == 0 || options.chunk_size % BLOCK_SIZE != 0 {
        return Err(ExtractError::ChunkNotBlockAligned(options.chunk_size));
    }

    let mut source = if looks_compressed(buffer) {
        Source::Gzip(GzipDecoder::open(buffer)?)
    } else {
        Source::Plain(buffer)
    };

    // The root name may sit behind a PAX header and its payload, so look at least that far ahead
    // even when the chunks are smaller.
    let mut chunk = vec![0u8; options.chunk_size.max(ROOT_LOOKAHEAD)];
    let len = source.fill(&mut chunk)?;
    let head = &chunk[..len];
    if !header::is_archive_start(head) {
        tracing::debug!("the buffer does not contain a tar archive");
        source.close();
        return Ok(None);
    }

    std::fs::create_dir_all(&options.destination)
        .map_err(ExtractError::fs(FsOp::CreateDirectory, &options.destination))?;
    let mut extractor = Extractor::begin(&options.destination)?;
    let root = root_directory_name(head);

    for piece in head.chunks(options.chunk_size) {
        feed(&mut extractor, piece)?;
    }

    chunk.truncate(options.chunk_size);
    loop {
        let len = source.fill(&mut chunk)?;
        if len == 0 {
            break;
        }
        feed(&mut extractor, &chunk[..len])?;
    }

    tracing::debug!(
        "extracted {} entries into {}",
        extractor.entries(),
        options.destination.display()
    );
    extractor.end()?;
    source.close();

    Ok(root)
}

/// Feeds the block-aligned part of `data` to the extractor. A trailing partial block is only
/// accepted after the end-of-archive marker.
fn feed(extractor: &mut Extractor, data: &[u8]) -> Result<(), ExtractError> {
    let aligned = data.len() - data.len() % BLOCK_SIZE;
    if aligned > 0 {
        extractor.feed(&data[..aligned])?;
    }
    if aligned < data.len() && !extractor.is_finished() {
        return Err(ExtractError::TruncatedArchive {
            len: data.len() - aligned,
        });
    }
    Ok(())
}

/// Returns the name of the directory described by the first header of `chunk`, skipping a
/// leading PAX header. Trailing slashes are removed.
pub fn root_directory_name(chunk: &[u8]) -> Option<String> {
    let first = Header::parse(block_at(chunk, 0)?)?;

    // The PAX payload is assumed to fit in a single block.
    let offset = if first.entry_kind().is_some_and(EntryKind::is_pax) {
        2 * BLOCK_SIZE
    } else {
        0
    };

    let header = Header::parse(block_at(chunk, offset)?)?;
    if header.entry_kind() != Some(EntryKind::Directory) {
        return None;
    }

    let name = header.resolved_name();
    let end = name.iter().rposition(|&b| b != b'/').map_or(0, |i| i + 1);
    Some(String::from_utf8_lossy(&name[..end]).into_owned())
}

/// Where the decompressed archive stream comes from.
enum Source<'a> {
    Gzip(GzipDecoder<'a>),
    Plain(&'a [u8]),
}

impl Source<'_> {
    /// Fills `chunk` as far as the stream allows. Only the last chunk of a stream is short.
    fn fill(&mut self, chunk: &mut [u8]) -> Result<usize, ExtractError> {
        match self {
            Source::Gzip(decoder) => {
                let mut filled = 0;
                while filled < chunk.len() {
                    let n = decoder.read(&mut chunk[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(filled)
            }
            Source::Plain(remaining) => {
                let data = *remaining;
                let n = data.len().min(chunk.len());
                let (head, tail) = data.split_at(n);
                chunk[..n].copy_from_slice(head);
                *remaining = tail;
                Ok(n)
            }
        }
    }

    fn close(self) {
        if let Source::Gzip(decoder) = self {
            decoder.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::test_utils::{append_entry, finish_archive, RawHeader};
    use assert_matches::assert_matches;
    use rstest::rstest;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_root_directory_name() {
        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"proj/", b'5', 0), &[]);
        assert_eq!(root_directory_name(&archive).as_deref(), Some("proj"));

        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"proj/a.txt", b'0', 2), b"hi");
        assert_eq!(root_directory_name(&archive), None);
    }

    #[test]
    fn test_root_directory_name_after_pax_header() {
        for flag in [b'g', b'x'] {
            let record = b"52 comment=78c5f6d3e0a1b5fc3e2ad0f5e8e8f0c1d2e3f4a5\n";
            let mut archive = Vec::new();
            append_entry(
                &mut archive,
                &RawHeader::new(b"pax_global_header", flag, record.len() as u64),
                record,
            );
            append_entry(&mut archive, &RawHeader::new(b"proj-1.0/", b'5', 0), &[]);
            assert_eq!(root_directory_name(&archive).as_deref(), Some("proj-1.0"));
        }
    }

    #[test]
    fn test_root_directory_name_out_of_range() {
        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"pax_global_header", b'g', 0), &[]);
        assert_eq!(root_directory_name(&archive), None);
        assert_eq!(root_directory_name(&[]), None);
    }

    #[test]
    fn test_chunk_size_must_be_aligned() {
        let temp_dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions::new(temp_dir.path()).with_chunk_size(1000);
        assert_matches!(
            unpack(&[], &options),
            Err(ExtractError::ChunkNotBlockAligned(1000))
        );
    }

    #[test]
    fn test_not_an_archive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("out");
        let options = ExtractOptions::new(&destination);

        assert_matches!(unpack(b"just some text", &options), Ok(None));
        assert_matches!(unpack(&gzip(&[b'x'; 4096]), &options), Ok(None));
        assert_matches!(
            extract(&gzip(b"not a tar"), &destination),
            Err(ExtractError::NoDirectoryFound)
        );
        assert!(!destination.exists());
    }

    #[test]
    fn test_trailing_partial_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"proj/", b'5', 0), &[]);
        append_entry(&mut archive, &RawHeader::new(b"proj/a.txt", b'0', 2), b"hi");
        archive.extend_from_slice(&[0u8; 100]);

        assert_matches!(
            extract(&gzip(&archive), temp_dir.path()),
            Err(ExtractError::TruncatedArchive { len: 100 })
        );
    }

    #[rstest]
    #[case(BLOCK_SIZE)]
    #[case(DEFAULT_CHUNK_SIZE)]
    fn test_trailing_bytes_after_end_marker(#[case] chunk_size: usize) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"proj/", b'5', 0), &[]);
        append_entry(&mut archive, &RawHeader::new(b"proj/a.txt", b'0', 2), b"hi");
        finish_archive(&mut archive);
        archive.extend_from_slice(&[0u8; 100]);

        let options = ExtractOptions::new(temp_dir.path()).with_chunk_size(chunk_size);
        assert_eq!(unpack(&archive, &options).unwrap().as_deref(), Some("proj"));
        assert_eq!(
            std::fs::read(temp_dir.path().join("proj/a.txt")).unwrap(),
            b"hi"
        );
    }

    #[rstest]
    #[case(BLOCK_SIZE)]
    #[case(2 * BLOCK_SIZE)]
    #[case(3 * BLOCK_SIZE)]
    #[case(DEFAULT_CHUNK_SIZE)]
    fn test_root_directory_behind_pax_header_with_small_chunks(#[case] chunk_size: usize) {
        let temp_dir = tempfile::tempdir().unwrap();
        let record = b"52 comment=78c5f6d3e0a1b5fc3e2ad0f5e8e8f0c1d2e3f4a5\n";
        let mut archive = Vec::new();
        append_entry(
            &mut archive,
            &RawHeader::new(b"pax_global_header", b'g', record.len() as u64),
            record,
        );
        append_entry(&mut archive, &RawHeader::new(b"proj/", b'5', 0), &[]);
        append_entry(&mut archive, &RawHeader::new(b"proj/a.txt", b'0', 2), b"hi");
        finish_archive(&mut archive);

        let options = ExtractOptions::new(temp_dir.path()).with_chunk_size(chunk_size);
        assert_eq!(
            extract_with_options(&gzip(&archive), &options).unwrap(),
            "proj"
        );
        assert_eq!(
            std::fs::read(temp_dir.path().join("proj/a.txt")).unwrap(),
            b"hi"
        );
    }

    #[test]
    fn test_archive_shorter_than_lookahead() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = Vec::new();
        append_entry(&mut archive, &RawHeader::new(b"proj/", b'5', 0), &[]);

        let options = ExtractOptions::new(temp_dir.path()).with_chunk_size(BLOCK_SIZE);
        assert_eq!(unpack(&archive, &options).unwrap().as_deref(), Some("proj"));
        assert!(temp_dir.path().join("proj").is_dir());
    }
}
