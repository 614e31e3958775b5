//! Connection dispatch and the upload/download/probe handlers.
//!
//! One task per accepted connection. The worker reads a single kind byte and
//! hands the rest of the stream to the matching handler; whatever happens,
//! the connection is closed when the handler returns. Chunked payloads are
//! relayed between socket and data file one frame at a time, so memory use
//! stays flat no matter how large the blob is.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::networking::set_tcp_buffers;
use crate::protocol::{self, ChunkedHeader, MessageKind, ProtocolError, SingleHeader, Status};
use crate::ratelimit::RateLimiter;
use crate::store::{Store, StoreError, StoredBlob};
use crate::{
    BENCH_BLOCK_SIZE, BENCH_PHASE_DURATION, BUF_SIZE, CHUNK_SIZE, NONCE_SIZE, PROBE_PAYLOAD_SIZE,
    TAG_SIZE,
};

#[derive(Clone)]
pub struct ServerConfig {
    /// This server's digit in the address list; first digit of every code
    /// minted here.
    pub server_id: u8,
    /// Plaintext size cap per blob; zero disables the cap.
    pub max_blob_size: u64,
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("declared plaintext length {declared} but chunks carried {counted}")]
    LengthMismatch { declared: u64, counted: u64 },
    #[error("stored blob for code {0} is malformed")]
    CorruptBlob(String),
}

/// Accept loop: one worker task per connection, forever.
pub async fn run(
    listener: TcpListener,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    config: ServerConfig,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept: {e}");
                continue;
            }
        };
        debug!("client connected: {addr}");
        let store = Arc::clone(&store);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        tokio::spawn(handle_conn(stream, addr, store, limiter, config));
    }
}

async fn handle_conn(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    config: ServerConfig,
) {
    set_tcp_buffers(&stream);
    let (read_half, write_half) = stream.into_split();
    let mut r = BufReader::with_capacity(BUF_SIZE, read_half);
    let mut w = BufWriter::with_capacity(BUF_SIZE, write_half);

    let kind = match protocol::read_kind(&mut r).await {
        Ok(kind) => kind,
        Err(ProtocolError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
        Err(e) => {
            error!("read kind from {addr}: {e}");
            let _ = protocol::write_status(&mut w, Status::Error).await;
            let _ = w.flush().await;
            return;
        }
    };

    let result = match kind {
        MessageKind::Upload => handle_upload(&mut r, &mut w, &store, &config).await,
        MessageKind::SecureUpload => handle_secure_upload(&mut r, &mut w, &store, &config).await,
        MessageKind::Download => handle_download(&mut r, &mut w, addr, &store, &limiter).await,
        MessageKind::Probe => handle_probe(&mut r, &mut w, &store).await,
        MessageKind::Bench => handle_bench(&mut r, &mut w).await,
    };
    if let Err(e) = result {
        debug!("connection {addr}: {e}");
    }
    let _ = w.flush().await;
}

// =============================================================================
// Uploads
// =============================================================================

struct UploadOutcome {
    code: String,
    name: String,
}

async fn handle_upload<R, W>(
    r: &mut R,
    w: &mut W,
    store: &Store,
    config: &ServerConfig,
) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match receive_chunked_upload(r, store, config.max_blob_size, None, false).await {
        Ok(outcome) => {
            println!(
                "Received: {} (code {}), stored encrypted to disk",
                outcome.name, outcome.code
            );
            protocol::write_status(w, Status::Ok).await?;
            Ok(())
        }
        Err(e) => {
            error!("upload: {e}");
            protocol::write_status(w, Status::Error).await?;
            Ok(())
        }
    }
}

async fn handle_secure_upload<R, W>(
    r: &mut R,
    w: &mut W,
    store: &Store,
    config: &ServerConfig,
) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let format = r.read_u8().await?;
    let received = match format {
        0 => receive_secure_single(r, store, config).await,
        1 => {
            let code = mint_code(store, config.server_id);
            receive_chunked_upload(r, store, config.max_blob_size, Some(code), true).await
        }
        other => {
            error!("secure upload: unknown format byte {other}");
            protocol::write_status(w, Status::Error).await?;
            return Ok(());
        }
    };
    match received {
        Ok(outcome) => {
            println!(
                "Received: {} (code {}), sealed with an external key",
                outcome.name, outcome.code
            );
            protocol::write_code_response(w, Status::Ok, Some(&outcome.code)).await?;
            Ok(())
        }
        Err(e) => {
            error!("secure upload: {e}");
            protocol::write_status(w, Status::Error).await?;
            Ok(())
        }
    }
}

/// Streams a chunked upload from the socket into `<code>.dat`, then
/// publishes the metadata record. `minted` carries the server-assigned code
/// for secure uploads; regular uploads read the client's code off the wire.
/// Any failure deletes the partial data file.
async fn receive_chunked_upload<R>(
    r: &mut R,
    store: &Store,
    max_plain: u64,
    minted: Option<String>,
    secure: bool,
) -> Result<UploadOutcome, HandlerError>
where
    R: AsyncRead + Unpin,
{
    let code = match minted {
        Some(code) => code,
        None => protocol::read_code(r).await?,
    };
    let header = protocol::read_chunked_header(r, max_plain).await?;
    let name = protocol::sanitize_name(&header.name)?;
    debug!(
        "receiving {} under code {}: {} bytes in {} chunk(s)",
        name, code, header.total_plain_len, header.num_chunks
    );

    let data_path = store.data_path(&code);
    let mut df = tokio::fs::File::create(&data_path).await?;
    let streamed = stream_chunks_to_file(r, &mut df, header.num_chunks, max_plain).await;
    let plain_count = match streamed {
        Ok(count) => count,
        Err(e) => {
            drop(df);
            let _ = tokio::fs::remove_file(&data_path).await;
            return Err(e);
        }
    };
    if let Err(e) = df.sync_all().await {
        let _ = tokio::fs::remove_file(&data_path).await;
        return Err(e.into());
    }
    drop(df);

    if plain_count != header.total_plain_len {
        let _ = tokio::fs::remove_file(&data_path).await;
        return Err(HandlerError::LengthMismatch {
            declared: header.total_plain_len,
            counted: plain_count,
        });
    }

    let blob = StoredBlob::new_chunked(
        name.clone(),
        header.checksum,
        header.total_plain_len,
        header.num_chunks,
        secure,
    );
    if let Err(e) = store.publish(&code, &blob) {
        let _ = tokio::fs::remove_file(&data_path).await;
        return Err(e.into());
    }
    Ok(UploadOutcome { code, name })
}

/// Copies `num_chunks` sealed frames from the socket to the data file,
/// keeping a running plaintext total that must never pass `max_plain`.
/// Returns the plaintext byte count implied by the frames.
async fn stream_chunks_to_file<R>(
    r: &mut R,
    df: &mut tokio::fs::File,
    num_chunks: u32,
    max_plain: u64,
) -> Result<u64, HandlerError>
where
    R: AsyncRead + Unpin,
{
    let mut plain_count: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE + TAG_SIZE];
    for _ in 0..num_chunks {
        let (nonce, sealed_len) = protocol::read_chunk_frame_header(r).await?;
        plain_count += u64::from(sealed_len - TAG_SIZE as u32);
        if max_plain > 0 && plain_count > max_plain {
            return Err(ProtocolError::BlobTooLarge.into());
        }
        df.write_all(&nonce).await?;
        df.write_u32(sealed_len).await?;
        let mut remaining = sealed_len as usize;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            r.read_exact(&mut buf[..n]).await?;
            df.write_all(&buf[..n]).await?;
            remaining -= n;
        }
    }
    Ok(plain_count)
}

/// Secure single-blob upload: the whole sealed record is bounded by the
/// size cap and held in memory, like the metadata record it becomes.
async fn receive_secure_single<R>(
    r: &mut R,
    store: &Store,
    config: &ServerConfig,
) -> Result<UploadOutcome, HandlerError>
where
    R: AsyncRead + Unpin,
{
    let max_sealed = if config.max_blob_size > 0 {
        config.max_blob_size.saturating_add(TAG_SIZE as u64)
    } else {
        0
    };
    let header = protocol::read_single_header(r, max_sealed).await?;
    let name = protocol::sanitize_name(&header.name)?;
    let mut sealed = vec![0u8; header.sealed_len as usize];
    r.read_exact(&mut sealed).await?;

    let code = mint_code(store, config.server_id);
    let blob = StoredBlob::new_single(name.clone(), header.checksum, header.nonce, sealed, true);
    store.publish(&code, &blob)?;
    Ok(UploadOutcome { code, name })
}

/// Fresh code with this server's digit up front. A handful of retries keeps
/// collisions with live codes rare; after that, last write wins.
fn mint_code(store: &Store, server_id: u8) -> String {
    for _ in 0..5 {
        let code = protocol::generate_code(server_id);
        if !store.contains(&code) {
            return code;
        }
    }
    protocol::generate_code(server_id)
}

// =============================================================================
// Downloads
// =============================================================================

async fn handle_download<R, W>(
    r: &mut R,
    w: &mut W,
    addr: SocketAddr,
    store: &Store,
    limiter: &RateLimiter,
) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let code = match protocol::read_code(r).await {
        Ok(code) => code,
        Err(e) => {
            error!("download: read code from {addr}: {e}");
            protocol::write_status(w, Status::Error).await?;
            return Ok(());
        }
    };
    if !limiter.allow(addr.ip()) {
        error!("rate limit / ban: {}", addr.ip());
        protocol::write_status(w, Status::Error).await?;
        return Ok(());
    }
    let Some(blob) = store.lookup(&code) else {
        protocol::write_status(w, Status::NotFound).await?;
        return Ok(());
    };

    println!("info: sending encrypted file for code {code}");
    protocol::write_status(w, Status::Ok).await?;
    protocol::write_format(w, blob.format()).await?;
    if blob.chunked {
        send_chunked_from_file(w, &store.data_path(&code), &blob).await?;
    } else {
        let (Some(nonce), Some(sealed)) = (blob.nonce, blob.sealed.as_deref()) else {
            return Err(HandlerError::CorruptBlob(code));
        };
        protocol::write_single_header(
            w,
            &SingleHeader {
                name: blob.name.clone(),
                checksum: blob.plaintext_checksum,
                nonce,
                sealed_len: sealed.len() as u64,
            },
        )
        .await?;
        w.write_all(sealed).await?;
    }
    debug!("sent {} (code {})", blob.name, code);
    Ok(())
}

/// Streams the sealed frames of `<code>.dat` straight to the socket. No
/// decryption happens here; the bytes go out exactly as they came in.
async fn send_chunked_from_file<W>(
    w: &mut W,
    data_path: &Path,
    blob: &StoredBlob,
) -> Result<(), HandlerError>
where
    W: AsyncWrite + Unpin,
{
    let mut df = tokio::fs::File::open(data_path).await?;
    protocol::write_chunked_header(
        w,
        &ChunkedHeader {
            name: blob.name.clone(),
            total_plain_len: blob.total_plain_len,
            num_chunks: blob.num_chunks,
            checksum: blob.plaintext_checksum,
        },
    )
    .await?;

    let mut buf = vec![0u8; CHUNK_SIZE + TAG_SIZE];
    let mut frame = [0u8; NONCE_SIZE + 4];
    for _ in 0..blob.num_chunks {
        df.read_exact(&mut frame).await?;
        w.write_all(&frame).await?;
        let sealed_len = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]) as usize;
        let mut remaining = sealed_len;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            df.read_exact(&mut buf[..n]).await?;
            w.write_all(&buf[..n]).await?;
            remaining -= n;
        }
    }
    Ok(())
}

// =============================================================================
// Probe and bench
// =============================================================================

/// Free-space answer plus a fixed payload the client times to estimate
/// bandwidth.
async fn handle_probe<R, W>(r: &mut R, w: &mut W, store: &Store) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let requested = r.read_u64().await?;
    let free = store.free_bytes();
    debug!("probe: {requested} bytes requested, {free} free");
    w.write_u64(free).await?;
    w.write_u32(PROBE_PAYLOAD_SIZE).await?;
    let zeros = vec![0u8; BENCH_BLOCK_SIZE];
    let mut remaining = PROBE_PAYLOAD_SIZE as usize;
    while remaining > 0 {
        let n = remaining.min(zeros.len());
        w.write_all(&zeros[..n]).await?;
        remaining -= n;
    }
    Ok(())
}

/// Symmetric throughput measurement: we stream length-prefixed blocks for
/// one phase, the client streams back for the next, and we report how many
/// bytes arrived. A zero-length block ends each phase.
async fn handle_bench<R, W>(r: &mut R, w: &mut W) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let block = vec![0u8; BENCH_BLOCK_SIZE];
    let deadline = Instant::now() + BENCH_PHASE_DURATION;
    while Instant::now() < deadline {
        w.write_u32(block.len() as u32).await?;
        w.write_all(&block).await?;
    }
    w.write_u32(0).await?;
    w.flush().await?;

    let mut received: u64 = 0;
    let mut buf = vec![0u8; BENCH_BLOCK_SIZE];
    loop {
        let len = r.read_u32().await? as usize;
        if len == 0 {
            break;
        }
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(buf.len());
            r.read_exact(&mut buf[..n]).await?;
            remaining -= n;
        }
        received += len as u64;
    }
    w.write_u64(received).await?;
    debug!("bench: client uploaded {received} bytes");
    Ok(())
}
