//! Decoding of 512-byte ustar header blocks.
//!
//! A [`Header`] borrows a block and decodes individual fields on demand by slicing fixed byte
//! ranges, so nothing depends on the memory layout of a Rust struct.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Every header and data region of a tar archive is a multiple of this size.
pub const BLOCK_SIZE: usize = 512;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CHECKSUM: Range<usize> = 148..156;
const TYPE_FLAG: usize = 156;
const LINK_NAME: Range<usize> = 157..257;
const MAGIC: Range<usize> = 257..265;
const UNAME: Range<usize> = 265..297;
const GNAME: Range<usize> = 297..329;
const DEV_MAJOR: Range<usize> = 329..337;
const DEV_MINOR: Range<usize> = 337..345;
const PREFIX: Range<usize> = 345..500;
#[cfg_attr(not(test), allow(dead_code))]
const PADDING: Range<usize> = 500..512;

/// Upper bound of a resolved name including the separator and a terminator: a full prefix, a
/// `/` and a full name field.
pub const FULLNAME_LEN: usize = (PREFIX.end - PREFIX.start) + (NAME.end - NAME.start) + 2;

/// The kind of entry a header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file, typeflag `\0`.
    Regular,
    /// A regular file, typeflag `0`.
    Normal,
    /// A hard link to an earlier entry.
    HardLink,
    /// A symbolic link.
    Symlink,
    /// A character device node.
    CharDevice,
    /// A block device node.
    BlockDevice,
    /// A directory.
    Directory,
    /// A named pipe.
    Fifo,
    /// A contiguous file.
    Contiguous,
    /// PAX extended attributes for all following entries.
    PaxGlobalHeader,
    /// PAX extended attributes for the next entry.
    PaxPerFileHeader,
}

impl EntryKind {
    /// Decodes a typeflag byte, returns `None` for unknown flags.
    pub fn from_type_flag(flag: u8) -> Option<Self> {
        Some(match flag {
            b'\0' => EntryKind::Regular,
            b'0' => EntryKind::Normal,
            b'1' => EntryKind::HardLink,
            b'2' => EntryKind::Symlink,
            b'3' => EntryKind::CharDevice,
            b'4' => EntryKind::BlockDevice,
            b'5' => EntryKind::Directory,
            b'6' => EntryKind::Fifo,
            b'7' => EntryKind::Contiguous,
            b'g' => EntryKind::PaxGlobalHeader,
            b'x' => EntryKind::PaxPerFileHeader,
            _ => return None,
        })
    }

    /// Returns true for the PAX extended header kinds.
    pub fn is_pax(self) -> bool {
        matches!(
            self,
            EntryKind::PaxGlobalHeader | EntryKind::PaxPerFileHeader
        )
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Regular | EntryKind::Normal => "regular file",
            EntryKind::HardLink => "hard link",
            EntryKind::Symlink => "symlink",
            EntryKind::CharDevice => "character device",
            EntryKind::BlockDevice => "block device",
            EntryKind::Directory => "directory",
            EntryKind::Fifo => "fifo",
            EntryKind::Contiguous => "contiguous file",
            EntryKind::PaxGlobalHeader => "pax global header",
            EntryKind::PaxPerFileHeader => "pax header",
        })
    }
}

/// The flavours of the magic field that are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// POSIX ustar, `ustar\0` followed by version `00`.
    Ustar,
    /// GNU tar, `ustar  \0`.
    Gnu,
    /// Pre-POSIX archives leave the field zeroed.
    Legacy,
}

impl Magic {
    fn from_field(field: &[u8]) -> Option<Self> {
        match field {
            b"ustar\x0000" => Some(Magic::Ustar),
            b"ustar  \x00" => Some(Magic::Gnu),
            [0, 0, 0, 0, 0, 0, 0, 0] => Some(Magic::Legacy),
            _ => None,
        }
    }
}

/// A validated view on a header block.
#[derive(Clone, Copy)]
pub struct Header<'a> {
    block: &'a [u8; BLOCK_SIZE],
}

impl<'a> Header<'a> {
    /// Interprets `block` as a header. Returns `None` unless the magic field is recognized and
    /// the stored checksum matches the block contents.
    pub fn parse(block: &'a [u8; BLOCK_SIZE]) -> Option<Self> {
        let header = Self { block };
        header.magic()?;
        (header.checksum()? == compute_checksum(block)).then_some(header)
    }

    /// The magic field, `None` if it holds none of the accepted values.
    pub fn magic(&self) -> Option<Magic> {
        Magic::from_field(&self.block[MAGIC])
    }

    /// The stored checksum.
    pub fn checksum(&self) -> Option<u32> {
        parse_octal(&self.block[CHECKSUM]).and_then(|sum| u32::try_from(sum).ok())
    }

    /// The permission bits.
    pub fn mode(&self) -> Option<u32> {
        parse_octal(&self.block[MODE]).map(|mode| (mode & 0o7777) as u32)
    }

    /// The declared size of the entry data in bytes.
    pub fn size(&self) -> Option<u64> {
        parse_octal(&self.block[SIZE])
    }

    /// The modification time in seconds since the epoch.
    pub fn mtime(&self) -> Option<u64> {
        parse_octal(&self.block[MTIME])
    }

    /// The raw typeflag byte.
    pub fn type_flag(&self) -> u8 {
        self.block[TYPE_FLAG]
    }

    /// The entry kind, `None` for unknown typeflags.
    pub fn entry_kind(&self) -> Option<EntryKind> {
        EntryKind::from_type_flag(self.type_flag())
    }

    /// The target of a link entry.
    pub fn link_name(&self) -> &'a [u8] {
        let block: &'a [u8; BLOCK_SIZE] = self.block;
        until_nul(&block[LINK_NAME])
    }

    /// The full name of the entry, joining the prefix and name fields.
    pub fn resolved_name(&self) -> Cow<'a, [u8]> {
        let block: &'a [u8; BLOCK_SIZE] = self.block;
        let name = &block[NAME];
        let prefix = &block[PREFIX];
        if prefix[0] != 0 {
            let prefix = until_nul(prefix);
            let name = until_nul(name);
            let mut full = Vec::with_capacity(prefix.len() + 1 + name.len());
            full.extend_from_slice(prefix);
            full.push(b'/');
            full.extend_from_slice(name);
            Cow::Owned(full)
        } else {
            // A name that fills the whole field has no terminator.
            Cow::Borrowed(until_nul(name))
        }
    }

    /// The resolved name as a path, used for filesystem operations and error messages.
    pub fn path(&self) -> PathBuf {
        bytes_to_path(&self.resolved_name())
    }
}

impl fmt::Debug for Header<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("name", &String::from_utf8_lossy(&self.resolved_name()))
            .field("type_flag", &char::from(self.type_flag()))
            .field("mode", &self.mode())
            .field("uid", &parse_octal(&self.block[UID]))
            .field("gid", &parse_octal(&self.block[GID]))
            .field("size", &self.size())
            .field("mtime", &self.mtime())
            .field("magic", &self.magic())
            .field("uname", &String::from_utf8_lossy(until_nul(&self.block[UNAME])))
            .field("gname", &String::from_utf8_lossy(until_nul(&self.block[GNAME])))
            .field("devmajor", &parse_octal(&self.block[DEV_MAJOR]))
            .field("devminor", &parse_octal(&self.block[DEV_MINOR]))
            .finish()
    }
}

/// Computes the checksum of a header block: the unsigned sum of all bytes, with the checksum
/// field itself counted as eight spaces.
pub fn compute_checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    let blanked = u32::from(b' ') * (CHECKSUM.end - CHECKSUM.start) as u32;
    block[..CHECKSUM.start]
        .iter()
        .chain(&block[CHECKSUM.end..])
        .map(|&b| u32::from(b))
        .sum::<u32>()
        + blanked
}

/// Returns true if every byte of the block is zero, which marks the end of the archive.
pub fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Returns the block starting at `offset`, or `None` if fewer than [`BLOCK_SIZE`] bytes remain.
pub fn block_at(data: &[u8], offset: usize) -> Option<&[u8; BLOCK_SIZE]> {
    data.get(offset..offset.checked_add(BLOCK_SIZE)?)?
        .try_into()
        .ok()
}

/// Returns true if `chunk` begins like a tar archive: its first block is either a valid header
/// or an end-of-archive marker.
pub fn is_archive_start(chunk: &[u8]) -> bool {
    block_at(chunk, 0).is_some_and(|block| is_zero_block(block) || Header::parse(block).is_some())
}

/// Rounds a data length up to the next block boundary.
pub fn padded_len(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

/// Parses an octal number terminated by a NUL, a space, or the end of the field. Leading spaces
/// are skipped. Returns `None` if a byte is not an octal digit or the value overflows.
pub fn parse_octal(field: &[u8]) -> Option<u64> {
    let start = field.iter().position(|&b| b != b' ').unwrap_or(field.len());
    let mut value: u64 = 0;
    for &c in &field[start..] {
        match c {
            b'\0' | b' ' => break,
            b'0'..=b'7' => {
                value = value.checked_mul(8)?.checked_add(u64::from(c - b'0'))?;
            }
            _ => return None,
        }
    }
    Some(value)
}

fn until_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

#[cfg(unix)]
pub(crate) fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    Path::new(std::ffi::OsStr::from_bytes(bytes)).to_path_buf()
}

#[cfg(not(unix))]
pub(crate) fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    Path::new(String::from_utf8_lossy(bytes).as_ref()).to_path_buf()
}
