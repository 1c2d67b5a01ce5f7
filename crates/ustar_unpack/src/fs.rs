//! Functions to extract an archive from a file on disk.

use std::path::Path;

use crate::read::{self, ExtractOptions};
use crate::ExtractError;

/// Memory maps the archive at the specified path and extracts it into `destination`. Returns the
/// name of the archive's top-level directory.
///
/// ```rust,no_run
/// # use std::path::Path;
/// use ustar_unpack::fs::extract;
/// let root = extract(Path::new("downloads/hello-2.12.tar.gz"), Path::new("/tmp")).unwrap();
/// assert_eq!(root, "hello-2.12");
/// ```
pub fn extract(archive: &Path, destination: &Path) -> Result<String, ExtractError> {
    extract_with_options(archive, &ExtractOptions::new(destination))
}

/// Same as [`extract`] but with explicit [`ExtractOptions`].
pub fn extract_with_options(
    archive: &Path,
    options: &ExtractOptions,
) -> Result<String, ExtractError> {
    let file = fs_err::File::open(archive).map_err(ExtractError::CouldNotOpenArchive)?;

    // SAFETY: the mapping is read-only and only lives for the duration of the extraction. The
    // archive is expected not to be modified while it is being extracted.
    let memory_map = unsafe { memmap2::Mmap::map(file.file()) }.map_err(|source| {
        ExtractError::CouldNotMapArchive {
            path: archive.to_path_buf(),
            source,
        }
    })?;

    tracing::debug!(
        "extracting {} ({} bytes) into {}",
        archive.display(),
        memory_map.len(),
        options.destination.display()
    );
    read::extract_with_options(&memory_map, options)
}
