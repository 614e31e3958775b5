use std::error::Error;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::cryptography;
use crate::networking;
use crate::probe;
use crate::protocol::{self, ChunkedHeader, MessageKind, PayloadFormat, Status};
use crate::{ADDRESS_LIST_URL, BUF_SIZE, CHUNK_SIZE, DIAL_TIMEOUT, KEY_SIZE, MAX_BLOB_SIZE, TAG_SIZE};

const MISMATCH: &str = "checksum mismatch - wrong code or corrupted data";

/// Function handler to kickoff receiver logic:
///     - Validate the 6-digit code
///     - Find the server from the code's first digit (or use --addr)
///     - Request the blob and read its payload format
///     - Decrypt with the code-derived key, or with the typed-in hex key
///       for secure uploads
///     - Verify the plaintext SHA-256 before keeping the file
pub async fn run(
    code: &str,
    addr: Option<String>,
    output: Option<String>,
    key_hex: Option<String>,
) -> Result<(), Box<dyn Error>> {
    if !protocol::valid_code(code) {
        return Err("code must be 6 digits".into());
    }
    let addr = match addr {
        Some(addr) => addr,
        None => {
            let entries = probe::fetch_server_list(ADDRESS_LIST_URL).await?;
            probe::server_for_code(&entries, code)
                .ok_or("no server listed for this code")?
                .addr
        }
    };
    debug!("downloading code {code} from {addr}");

    let stream = networking::dial(&addr, DIAL_TIMEOUT).await?;
    let (read_half, mut write_half) = stream.into_split();
    protocol::write_kind(&mut write_half, MessageKind::Download).await?;
    protocol::write_code(&mut write_half, code).await?;
    write_half.flush().await?;

    println!("info: waiting for server response...");
    let mut r = BufReader::with_capacity(BUF_SIZE, read_half);
    let status = protocol::read_status(&mut r).await?;
    match status {
        Status::Ok => {}
        Status::NotFound => return Err("code unknown or expired (data kept 1 hour)".into()),
        other => return Err(format!("server error (status {})", other as u8).into()),
    }
    let format = protocol::read_format(&mut r).await?;
    debug!("payload format: {format:?}");
    let key = resolve_key(code, format, key_hex)?;

    if format.is_chunked() {
        receive_chunked(&mut r, &key, output).await
    } else {
        receive_single(&mut r, &key, output).await
    }
}

/// Code-derived key for regular blobs; the user's 64-hex-character key for
/// secure ones, prompted for when not given on the command line.
fn resolve_key(
    code: &str,
    format: PayloadFormat,
    key_hex: Option<String>,
) -> Result<[u8; KEY_SIZE], Box<dyn Error>> {
    if !format.is_secure() {
        return Ok(cryptography::derive_code_key(code));
    }
    let raw = match key_hex {
        Some(raw) => raw,
        None => {
            println!("This file was sealed with its own key. Enter the 64-character hex key:");
            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            input
        }
    };
    Ok(cryptography::parse_key_hex(&raw)?)
}

async fn receive_single<R>(
    r: &mut R,
    key: &[u8; KEY_SIZE],
    output: Option<String>,
) -> Result<(), Box<dyn Error>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let header = protocol::read_single_header(r, MAX_BLOB_SIZE + TAG_SIZE as u64).await?;
    let bar = transfer_bar(header.sealed_len);
    let mut sealed = vec![0u8; header.sealed_len as usize];
    let mut got = 0usize;
    while got < sealed.len() {
        let n = (sealed.len() - got).min(CHUNK_SIZE);
        r.read_exact(&mut sealed[got..got + n]).await?;
        got += n;
        bar.set_position(got as u64);
    }
    bar.finish_and_clear();

    println!("info: decrypting...");
    let plaintext = cryptography::open_chunk(key, &header.nonce, &sealed).map_err(|_| MISMATCH)?;
    let digest: [u8; 32] = Sha256::digest(&plaintext).into();
    if digest != header.checksum {
        return Err(MISMATCH.into());
    }

    let save_path = output_path(output, &header.name);
    tokio::fs::write(&save_path, &plaintext).await?;
    println!("Downloaded: {}", save_path.display());
    Ok(())
}

async fn receive_chunked<R>(
    r: &mut R,
    key: &[u8; KEY_SIZE],
    output: Option<String>,
) -> Result<(), Box<dyn Error>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let header = protocol::read_chunked_header(r, 0).await?;
    let save_path = output_path(output, &header.name);
    match stream_chunks_to_path(r, key, &header, &save_path).await {
        Ok(()) => {
            println!("Downloaded: {}", save_path.display());
            Ok(())
        }
        Err(e) => {
            // Never leave a partial or unverified file behind.
            let _ = tokio::fs::remove_file(&save_path).await;
            Err(e)
        }
    }
}

/// Reads, decrypts and writes chunks one at a time, hashing the plaintext
/// as it goes; the final digest must match the header's checksum.
async fn stream_chunks_to_path<R>(
    r: &mut R,
    key: &[u8; KEY_SIZE],
    header: &ChunkedHeader,
    path: &Path,
) -> Result<(), Box<dyn Error>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let file = File::create(path).await?;
    let mut writer = BufWriter::new(file);
    let bar = transfer_bar(header.total_plain_len);
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    for _ in 0..header.num_chunks {
        let (nonce, sealed) = protocol::read_chunk_frame(r, 0).await?;
        let plaintext = cryptography::open_chunk(key, &nonce, &sealed).map_err(|_| MISMATCH)?;
        hasher.update(&plaintext);
        writer.write_all(&plaintext).await?;
        received += plaintext.len() as u64;
        bar.set_position(received);
    }
    writer.flush().await?;
    bar.finish_and_clear();

    let digest: [u8; 32] = hasher.finalize().into();
    if digest != header.checksum {
        return Err(MISMATCH.into());
    }
    Ok(())
}

fn output_path(output: Option<String>, name: &str) -> PathBuf {
    if let Some(output) = output {
        return PathBuf::from(output);
    }
    match protocol::sanitize_name(name) {
        Ok(name) => PathBuf::from(name),
        Err(_) => PathBuf::from("downloaded_file"),
    }
}

fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
            .unwrap(),
    );
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_prefers_explicit() {
        assert_eq!(
            output_path(Some("mine.bin".into()), "server.bin"),
            PathBuf::from("mine.bin")
        );
    }

    #[test]
    fn test_output_path_sanitizes_server_name() {
        assert_eq!(output_path(None, "report.pdf"), PathBuf::from("report.pdf"));
        // Only the base name survives a path-shaped name.
        assert_eq!(output_path(None, "../../etc/passwd"), PathBuf::from("passwd"));
        assert_eq!(output_path(None, "dir/.."), PathBuf::from("downloaded_file"));
        assert_eq!(output_path(None, ""), PathBuf::from("downloaded_file"));
    }
}
