//! On-wire framing for the relay protocol.
//!
//! Every connection starts with a single message-kind byte, followed by a
//! kind-specific exchange. All multi-byte integers are big-endian; strings
//! are length-prefixed with no terminator. Nothing in this module buffers a
//! whole blob: headers are fixed-size-ish records and chunk frames are read
//! and written one at a time.

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CODE_LENGTH, NONCE_SIZE, TAG_SIZE};

/// Longest file name that fits the u16 length prefix.
pub const MAX_NAME_LEN: usize = 0xFFFF;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("blob too large")]
    BlobTooLarge,
    #[error("code must be six decimal digits")]
    InvalidCode,
    #[error("invalid file name")]
    InvalidName,
    #[error("sealed length {0} is shorter than the authentication tag")]
    SealedTooShort(u32),
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("unknown status byte {0}")]
    UnknownStatus(u8),
    #[error("unknown payload format {0}")]
    UnknownFormat(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Tag bytes
// =============================================================================

/// First byte of every connection, selecting the exchange that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Upload = b'U',
    SecureUpload = b'S',
    Download = b'D',
    Probe = b'T',
    Bench = b'B',
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(Self::Upload),
            b'S' => Some(Self::SecureUpload),
            b'D' => Some(Self::Download),
            b'T' => Some(Self::Probe),
            b'B' => Some(Self::Bench),
            _ => None,
        }
    }
}

/// Single-byte response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    ChecksumError = 1,
    Error = 2,
    NotFound = 3,
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ok),
            1 => Some(Self::ChecksumError),
            2 => Some(Self::Error),
            3 => Some(Self::NotFound),
            _ => None,
        }
    }
}

/// How a download payload is laid out: `secure << 1 | chunked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadFormat {
    Plain = 0,
    PlainChunked = 1,
    Secure = 2,
    SecureChunked = 3,
}

impl PayloadFormat {
    pub fn new(secure: bool, chunked: bool) -> Self {
        match (secure, chunked) {
            (false, false) => Self::Plain,
            (false, true) => Self::PlainChunked,
            (true, false) => Self::Secure,
            (true, true) => Self::SecureChunked,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Plain),
            1 => Some(Self::PlainChunked),
            2 => Some(Self::Secure),
            3 => Some(Self::SecureChunked),
            _ => None,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Secure | Self::SecureChunked)
    }

    pub fn is_chunked(self) -> bool {
        matches!(self, Self::PlainChunked | Self::SecureChunked)
    }
}

// =============================================================================
// Codes
// =============================================================================

/// True iff `code` is exactly six ASCII digits.
pub fn valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}

/// Mint a fresh code: the server id as the first digit, five random digits
/// after it. Caller guarantees `server_id <= 9`.
pub fn generate_code(server_id: u8) -> String {
    debug_assert!(server_id <= 9);
    let mut rng = rand::thread_rng();
    format!("{}{:05}", server_id, rng.gen_range(0..100_000u32))
}

/// The server id encoded in a code's first digit, or `None` for a malformed
/// code.
pub fn code_server_id(code: &str) -> Option<u8> {
    if !valid_code(code) {
        return None;
    }
    code.chars().next()?.to_digit(10).map(|d| d as u8)
}

/// Reduce a peer-supplied name to a safe base name.
///
/// Takes the last path segment (either separator style), then rejects empty
/// names, `..`, and control characters.
pub fn sanitize_name(raw: &str) -> Result<String, ProtocolError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base.contains("..") || base.chars().any(|c| c.is_control()) {
        return Err(ProtocolError::InvalidName);
    }
    Ok(base.to_string())
}

// =============================================================================
// Tag byte read/write
// =============================================================================

pub async fn write_kind<W>(w: &mut W, kind: MessageKind) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(kind as u8).await?;
    Ok(())
}

pub async fn read_kind<R>(r: &mut R) -> Result<MessageKind, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let b = r.read_u8().await?;
    MessageKind::from_u8(b).ok_or(ProtocolError::UnknownKind(b))
}

pub async fn write_status<W>(w: &mut W, status: Status) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(status as u8).await?;
    Ok(())
}

pub async fn read_status<R>(r: &mut R) -> Result<Status, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let b = r.read_u8().await?;
    Status::from_u8(b).ok_or(ProtocolError::UnknownStatus(b))
}

pub async fn write_format<W>(w: &mut W, format: PayloadFormat) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(format as u8).await?;
    Ok(())
}

pub async fn read_format<R>(r: &mut R) -> Result<PayloadFormat, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let b = r.read_u8().await?;
    PayloadFormat::from_u8(b).ok_or(ProtocolError::UnknownFormat(b))
}

pub async fn write_code<W>(w: &mut W, code: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if !valid_code(code) {
        return Err(ProtocolError::InvalidCode);
    }
    w.write_all(code.as_bytes()).await?;
    Ok(())
}

pub async fn read_code<R>(r: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CODE_LENGTH];
    r.read_exact(&mut buf).await?;
    if !buf.iter().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidCode);
    }
    // All ASCII digits, so this cannot fail.
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Status byte, then the minted code when the status is OK.
pub async fn write_code_response<W>(
    w: &mut W,
    status: Status,
    code: Option<&str>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_status(w, status).await?;
    if status == Status::Ok {
        match code {
            Some(code) => write_code(w, code).await?,
            None => return Err(ProtocolError::InvalidCode),
        }
    }
    Ok(())
}

pub async fn read_code_response<R>(r: &mut R) -> Result<(Status, Option<String>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let status = read_status(r).await?;
    if status != Status::Ok {
        return Ok((status, None));
    }
    let code = read_code(r).await?;
    Ok((status, Some(code)))
}

// =============================================================================
// Headers
// =============================================================================

/// Header of a chunked payload: `nameLen:u16 | name | totalPlain:u64 |
/// numChunks:u32 | checksum:32`. The code (uploads only) travels separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedHeader {
    pub name: String,
    pub total_plain_len: u64,
    pub num_chunks: u32,
    pub checksum: [u8; 32],
}

/// Header of a single-blob payload: `nameLen:u16 | name | checksum:32 |
/// nonce:12 | sealedLen:u64`. The sealed bytes follow on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleHeader {
    pub name: String,
    pub checksum: [u8; 32],
    pub nonce: [u8; NONCE_SIZE],
    pub sealed_len: u64,
}

async fn write_name<W>(w: &mut W, name: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = name.as_bytes();
    let bytes = &bytes[..bytes.len().min(MAX_NAME_LEN)];
    w.write_u16(bytes.len() as u16).await?;
    w.write_all(bytes).await?;
    Ok(())
}

async fn read_name<R>(r: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub async fn write_chunked_header<W>(w: &mut W, header: &ChunkedHeader) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_name(w, &header.name).await?;
    w.write_u64(header.total_plain_len).await?;
    w.write_u32(header.num_chunks).await?;
    w.write_all(&header.checksum).await?;
    Ok(())
}

/// Read a chunked-payload header. `max_plain` bounds the declared plaintext
/// length; zero disables the check.
pub async fn read_chunked_header<R>(
    r: &mut R,
    max_plain: u64,
) -> Result<ChunkedHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let name = read_name(r).await?;
    let total_plain_len = r.read_u64().await?;
    if max_plain > 0 && total_plain_len > max_plain {
        return Err(ProtocolError::BlobTooLarge);
    }
    let num_chunks = r.read_u32().await?;
    let mut checksum = [0u8; 32];
    r.read_exact(&mut checksum).await?;
    Ok(ChunkedHeader {
        name,
        total_plain_len,
        num_chunks,
        checksum,
    })
}

pub async fn write_single_header<W>(w: &mut W, header: &SingleHeader) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_name(w, &header.name).await?;
    w.write_all(&header.checksum).await?;
    w.write_all(&header.nonce).await?;
    w.write_u64(header.sealed_len).await?;
    Ok(())
}

/// Read a single-blob header. `max_sealed` bounds the declared sealed length;
/// zero disables the check.
pub async fn read_single_header<R>(
    r: &mut R,
    max_sealed: u64,
) -> Result<SingleHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let name = read_name(r).await?;
    let mut checksum = [0u8; 32];
    r.read_exact(&mut checksum).await?;
    let mut nonce = [0u8; NONCE_SIZE];
    r.read_exact(&mut nonce).await?;
    let sealed_len = r.read_u64().await?;
    if max_sealed > 0 && sealed_len > max_sealed {
        return Err(ProtocolError::BlobTooLarge);
    }
    Ok(SingleHeader {
        name,
        checksum,
        nonce,
        sealed_len,
    })
}

// =============================================================================
// Chunk frames
// =============================================================================

/// One sealed chunk on the wire: `nonce:12 | sealedLen:u32 | sealed`.
pub async fn write_chunk_frame<W>(
    w: &mut W,
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(nonce).await?;
    w.write_u32(sealed.len() as u32).await?;
    w.write_all(sealed).await?;
    Ok(())
}

/// Read just the nonce and sealed length of the next chunk frame, leaving the
/// sealed bytes on the stream. Lets the caller check its running size cap
/// before committing to the read.
pub async fn read_chunk_frame_header<R>(
    r: &mut R,
) -> Result<([u8; NONCE_SIZE], u32), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut nonce = [0u8; NONCE_SIZE];
    r.read_exact(&mut nonce).await?;
    let sealed_len = r.read_u32().await?;
    if sealed_len < TAG_SIZE as u32 {
        return Err(ProtocolError::SealedTooShort(sealed_len));
    }
    Ok((nonce, sealed_len))
}

/// Read one whole chunk frame. `max_sealed` bounds the sealed length; zero
/// disables the check.
pub async fn read_chunk_frame<R>(
    r: &mut R,
    max_sealed: u32,
) -> Result<([u8; NONCE_SIZE], Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (nonce, sealed_len) = read_chunk_frame_header(r).await?;
    if max_sealed > 0 && sealed_len > max_sealed {
        return Err(ProtocolError::BlobTooLarge);
    }
    let mut sealed = vec![0u8; sealed_len as usize];
    r.read_exact(&mut sealed).await?;
    Ok((nonce, sealed))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for b in [b'U', b'S', b'D', b'T', b'B'] {
            let kind = MessageKind::from_u8(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert_eq!(MessageKind::from_u8(b'X'), None);
        assert_eq!(MessageKind::from_u8(0), None);
    }

    #[test]
    fn test_status_round_trip() {
        for b in 0..=3u8 {
            assert_eq!(Status::from_u8(b).unwrap() as u8, b);
        }
        assert_eq!(Status::from_u8(4), None);
    }

    #[test]
    fn test_format_from_flags() {
        assert_eq!(PayloadFormat::new(false, false), PayloadFormat::Plain);
        assert_eq!(PayloadFormat::new(false, true), PayloadFormat::PlainChunked);
        assert_eq!(PayloadFormat::new(true, false), PayloadFormat::Secure);
        assert_eq!(PayloadFormat::new(true, true), PayloadFormat::SecureChunked);
        for b in 0..=3u8 {
            let f = PayloadFormat::from_u8(b).unwrap();
            assert_eq!(f as u8, b);
            assert_eq!(PayloadFormat::new(f.is_secure(), f.is_chunked()), f);
        }
        assert_eq!(PayloadFormat::from_u8(4), None);
    }

    #[test]
    fn test_generated_codes_are_valid() {
        for server_id in 0..=9u8 {
            let code = generate_code(server_id);
            assert!(valid_code(&code), "bad code {code}");
            assert_eq!(code_server_id(&code), Some(server_id));
        }
    }

    #[test]
    fn test_valid_code_rejects_bad_shapes() {
        assert!(valid_code("012345"));
        assert!(!valid_code("12345"));
        assert!(!valid_code("1234567"));
        assert!(!valid_code("12a456"));
        assert!(!valid_code("12345."));
        assert!(!valid_code(""));
        assert_eq!(code_server_id("12a456"), None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_name("/tmp/report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_name("C:\\Users\\me\\report.pdf").unwrap(), "report.pdf");
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("foo../bar..").is_err());
        assert!(sanitize_name("evil\u{7}.txt").is_err());
        assert!(sanitize_name("dir/").is_err());
    }

    #[tokio::test]
    async fn test_code_read_write_round_trip() {
        let mut buf = Vec::new();
        write_code(&mut buf, "482917").await.unwrap();
        assert_eq!(buf, b"482917");
        let code = read_code(&mut buf.as_slice()).await.unwrap();
        assert_eq!(code, "482917");
    }

    #[tokio::test]
    async fn test_read_code_rejects_non_digits() {
        let mut bytes: &[u8] = b"12x456";
        assert!(matches!(
            read_code(&mut bytes).await,
            Err(ProtocolError::InvalidCode)
        ));
    }

    #[tokio::test]
    async fn test_write_code_rejects_bad_code() {
        let mut buf = Vec::new();
        assert!(write_code(&mut buf, "123").await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_chunked_header_round_trip() {
        let header = ChunkedHeader {
            name: "archive.tar.zst".to_string(),
            total_plain_len: 1_048_576,
            num_chunks: 4,
            checksum: [7u8; 32],
        };
        let mut buf = Vec::new();
        write_chunked_header(&mut buf, &header).await.unwrap();
        let decoded = read_chunked_header(&mut buf.as_slice(), 0).await.unwrap();
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn test_chunked_header_cap() {
        let header = ChunkedHeader {
            name: "big.bin".to_string(),
            total_plain_len: 1001,
            num_chunks: 1,
            checksum: [0u8; 32],
        };
        let mut buf = Vec::new();
        write_chunked_header(&mut buf, &header).await.unwrap();
        assert!(matches!(
            read_chunked_header(&mut buf.as_slice(), 1000).await,
            Err(ProtocolError::BlobTooLarge)
        ));
        // At the cap is fine.
        assert!(read_chunked_header(&mut buf.as_slice(), 1001).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_header_round_trip() {
        let header = SingleHeader {
            name: "photo.jpg".to_string(),
            checksum: [1u8; 32],
            nonce: [2u8; NONCE_SIZE],
            sealed_len: 4096,
        };
        let mut buf = Vec::new();
        write_single_header(&mut buf, &header).await.unwrap();
        let decoded = read_single_header(&mut buf.as_slice(), 0).await.unwrap();
        assert_eq!(decoded, header);

        assert!(matches!(
            read_single_header(&mut buf.as_slice(), 4095).await,
            Err(ProtocolError::BlobTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_name_truncated_to_u16() {
        let header = ChunkedHeader {
            name: "x".repeat(MAX_NAME_LEN + 100),
            total_plain_len: 0,
            num_chunks: 0,
            checksum: [0u8; 32],
        };
        let mut buf = Vec::new();
        write_chunked_header(&mut buf, &header).await.unwrap();
        let decoded = read_chunked_header(&mut buf.as_slice(), 0).await.unwrap();
        assert_eq!(decoded.name.len(), MAX_NAME_LEN);
    }

    #[tokio::test]
    async fn test_chunk_frame_round_trip() {
        let nonce = [9u8; NONCE_SIZE];
        let sealed = vec![0xAB; 300];
        let mut buf = Vec::new();
        write_chunk_frame(&mut buf, &nonce, &sealed).await.unwrap();
        assert_eq!(buf.len(), NONCE_SIZE + 4 + sealed.len());

        let (got_nonce, got_sealed) = read_chunk_frame(&mut buf.as_slice(), 0).await.unwrap();
        assert_eq!(got_nonce, nonce);
        assert_eq!(got_sealed, sealed);
    }

    #[tokio::test]
    async fn test_chunk_frame_rejects_short_sealed_len() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0u8; NONCE_SIZE]);
        buf.extend_from_slice(&15u32.to_be_bytes());
        assert!(matches!(
            read_chunk_frame(&mut buf.as_slice(), 0).await,
            Err(ProtocolError::SealedTooShort(15))
        ));
    }

    #[tokio::test]
    async fn test_chunk_frame_cap() {
        let nonce = [0u8; NONCE_SIZE];
        let sealed = vec![0u8; 64];
        let mut buf = Vec::new();
        write_chunk_frame(&mut buf, &nonce, &sealed).await.unwrap();
        assert!(matches!(
            read_chunk_frame(&mut buf.as_slice(), 63).await,
            Err(ProtocolError::BlobTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_code_response_round_trip() {
        let mut buf = Vec::new();
        write_code_response(&mut buf, Status::Ok, Some("712345"))
            .await
            .unwrap();
        let (status, code) = read_code_response(&mut buf.as_slice()).await.unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(code.as_deref(), Some("712345"));

        let mut buf = Vec::new();
        write_code_response(&mut buf, Status::Error, None).await.unwrap();
        assert_eq!(buf, vec![Status::Error as u8]);
        let (status, code) = read_code_response(&mut buf.as_slice()).await.unwrap();
        assert_eq!(status, Status::Error);
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_truncated_header_is_io_error() {
        let header = ChunkedHeader {
            name: "file.bin".to_string(),
            total_plain_len: 10,
            num_chunks: 1,
            checksum: [0u8; 32],
        };
        let mut buf = Vec::new();
        write_chunked_header(&mut buf, &header).await.unwrap();
        buf.truncate(buf.len() - 8);
        assert!(matches!(
            read_chunked_header(&mut buf.as_slice(), 0).await,
            Err(ProtocolError::Io(_))
        ));
    }
}
