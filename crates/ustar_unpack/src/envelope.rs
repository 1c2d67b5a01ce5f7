//! A pull-style gzip decoder over a borrowed, fully available buffer.

use std::io::Read;

use flate2::bufread::GzDecoder;

use crate::ExtractError;

/// gzip magic bytes (RFC 1952, 2.3.1).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The only compression method defined for gzip members.
const GZIP_CM_DEFLATE: u8 = 8;

/// Length of the fixed part of a gzip member header.
const GZIP_HEADER_LEN: usize = 10;

/// Flag bits that RFC 1952 reserves and requires to be zero.
const GZIP_FLAG_RESERVED: u8 = 0xe0;

/// Returns true if the buffer starts with the gzip magic bytes.
pub fn looks_compressed(buffer: &[u8]) -> bool {
    buffer.len() >= 2 && buffer[..2] == GZIP_MAGIC
}

/// Decompresses a gzip buffer on demand. Every call to [`GzipDecoder::read`] produces the next
/// run of decompressed bytes, which lets the caller pick a chunk size independently of how the
/// compressed data is laid out.
#[derive(Debug)]
pub struct GzipDecoder<'a> {
    inner: GzDecoder<&'a [u8]>,
    total_out: u64,
}

impl<'a> GzipDecoder<'a> {
    /// Validates the gzip member header of `buffer` and sets up a decoder that borrows it.
    pub fn open(buffer: &'a [u8]) -> Result<Self, ExtractError> {
        check_envelope_len(buffer.len())?;
        check_member_header(buffer)?;

        Ok(Self {
            inner: GzDecoder::new(buffer),
            total_out: 0,
        })
    }

    /// Decompresses up to `out.len()` bytes into `out` and returns how many were produced. A
    /// return value of 0 signals the end of the compressed stream.
    ///
    /// Oversized requests are clamped instead of rejected.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, ExtractError> {
        let capacity = clamp_request(out.len());
        let produced = loop {
            match self.inner.read(&mut out[..capacity]) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ExtractError::InflateError(e)),
            }
        };
        self.total_out += produced as u64;
        Ok(produced)
    }

    /// Returns the number of decompressed bytes produced so far.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    /// Releases the decoder.
    pub fn close(self) {
        tracing::trace!("closing gzip decoder after {} bytes", self.total_out);
    }
}

fn check_envelope_len(len: usize) -> Result<(), ExtractError> {
    if u32::try_from(len).is_err() {
        return Err(ExtractError::EnvelopeTooLarge { len });
    }
    Ok(())
}

fn check_member_header(buffer: &[u8]) -> Result<(), ExtractError> {
    if buffer.len() < GZIP_HEADER_LEN {
        return Err(ExtractError::EnvelopeInitFailed(format!(
            "the buffer is only {} bytes, a gzip header needs {GZIP_HEADER_LEN}",
            buffer.len()
        )));
    }
    if !looks_compressed(buffer) {
        return Err(ExtractError::EnvelopeInitFailed(
            "missing gzip magic bytes".to_string(),
        ));
    }
    if buffer[2] != GZIP_CM_DEFLATE {
        return Err(ExtractError::EnvelopeInitFailed(format!(
            "unsupported compression method {}",
            buffer[2]
        )));
    }
    if buffer[3] & GZIP_FLAG_RESERVED != 0 {
        return Err(ExtractError::EnvelopeInitFailed(format!(
            "reserved header flags set ({:#04x})",
            buffer[3]
        )));
    }
    Ok(())
}

fn clamp_request(len: usize) -> usize {
    len.min(u32::MAX as usize).min(isize::MAX as usize)
}
