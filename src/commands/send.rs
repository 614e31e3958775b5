use std::error::Error;
use std::path::Path;
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::debug;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::cryptography;
use crate::networking;
use crate::probe;
use crate::protocol::{self, ChunkedHeader, MessageKind, SingleHeader, Status};
use crate::{
    ADDRESS_LIST_URL, BUF_SIZE, CHUNK_SIZE, DIAL_TIMEOUT, KEY_SIZE, SECURE_SINGLE_BLOB_MAX,
};

/// Function handler to kickoff sender logic:
///     - Stat the input file (directories are refused)
///     - Probe the listed servers and pick the fastest one with room
///     - Regular mode: mint a code on the chosen server's id, derive the key
///       from it, and stream sealed 256 KiB chunks
///     - Secure mode: generate a fresh 256-bit key, upload single-blob or
///       chunked depending on size, and print the server-minted code
pub async fn run(file_path: &str, addr: Option<String>, secure: bool) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("open {file_path}: {e}"))?;
    if meta.is_dir() {
        return Err("path is a directory, not a file".into());
    }
    let file_size = meta.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let (server_id, server_addr) = resolve_server(addr, file_size).await?;
    debug!("selected server {server_id} at {server_addr}");

    if secure {
        send_secure(path, &name, file_size, &server_addr).await
    } else {
        send_regular(path, &name, file_size, server_id, &server_addr).await
    }
}

/// Picks the upload target: an explicit `--addr` skips probing (codes then
/// carry server id 0), otherwise the fetched list is probed and the fastest
/// qualifying server wins.
async fn resolve_server(
    addr: Option<String>,
    file_size: u64,
) -> Result<(u8, String), Box<dyn Error>> {
    if let Some(addr) = addr {
        return Ok((0, addr));
    }
    let entries = probe::fetch_server_list(ADDRESS_LIST_URL).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Probing servers");
    let best = probe::pick_best_server(&entries, file_size).await;
    spinner.finish_and_clear();

    let best = best.ok_or("no server available")?;
    println!(
        "info: using server {} at {} ({}/s)",
        best.id,
        best.addr,
        HumanBytes(best.bytes_per_sec as u64)
    );
    Ok((best.id, best.addr))
}

async fn send_regular(
    path: &Path,
    name: &str,
    file_size: u64,
    server_id: u8,
    addr: &str,
) -> Result<(), Box<dyn Error>> {
    let checksum = file_checksum(path).await?;
    let code = protocol::generate_code(server_id);
    let key = cryptography::derive_code_key(&code);

    println!("info: encrypting with your code...");
    let stream = networking::dial(addr, DIAL_TIMEOUT).await?;
    let (mut read_half, write_half) = stream.into_split();
    let mut w = BufWriter::with_capacity(BUF_SIZE, write_half);

    protocol::write_kind(&mut w, MessageKind::Upload).await?;
    protocol::write_code(&mut w, &code).await?;
    protocol::write_chunked_header(
        &mut w,
        &ChunkedHeader {
            name: name.to_string(),
            total_plain_len: file_size,
            num_chunks: chunk_count(file_size),
            checksum,
        },
    )
    .await?;

    let mut file = File::open(path).await?;
    let bar = transfer_bar(file_size);
    stream_sealed_chunks(&mut w, &mut file, &key, file_size, &bar).await?;
    w.flush().await?;
    bar.finish_and_clear();

    println!("info: waiting for server...");
    let status = protocol::read_status(&mut read_half).await?;
    match status {
        Status::Ok => {
            println!("File sent (encrypted). Your code: {code} (valid 1 hour)");
            Ok(())
        }
        Status::Error => Err("server error".into()),
        other => Err(format!("unexpected status {}", other as u8).into()),
    }
}

async fn send_secure(
    path: &Path,
    name: &str,
    file_size: u64,
    addr: &str,
) -> Result<(), Box<dyn Error>> {
    let key = cryptography::generate_key();
    let checksum = file_checksum(path).await?;

    println!("info: encrypting with a fresh 256-bit key...");
    let stream = networking::dial(addr, DIAL_TIMEOUT).await?;
    let (mut read_half, write_half) = stream.into_split();
    let mut w = BufWriter::with_capacity(BUF_SIZE, write_half);
    protocol::write_kind(&mut w, MessageKind::SecureUpload).await?;

    let mut file = File::open(path).await?;
    let bar = transfer_bar(file_size);
    if file_size <= SECURE_SINGLE_BLOB_MAX {
        // Small enough to seal in one piece.
        w.write_u8(0).await?;
        let mut plaintext = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut plaintext).await?;
        let (nonce, sealed) = cryptography::seal_chunk(&key, &plaintext)?;
        protocol::write_single_header(
            &mut w,
            &SingleHeader {
                name: name.to_string(),
                checksum,
                nonce,
                sealed_len: sealed.len() as u64,
            },
        )
        .await?;
        let mut sent = 0usize;
        while sent < sealed.len() {
            let n = (sealed.len() - sent).min(CHUNK_SIZE);
            w.write_all(&sealed[sent..sent + n]).await?;
            sent += n;
            bar.set_position(sent as u64);
        }
    } else {
        w.write_u8(1).await?;
        protocol::write_chunked_header(
            &mut w,
            &ChunkedHeader {
                name: name.to_string(),
                total_plain_len: file_size,
                num_chunks: chunk_count(file_size),
                checksum,
            },
        )
        .await?;
        stream_sealed_chunks(&mut w, &mut file, &key, file_size, &bar).await?;
    }
    w.flush().await?;
    bar.finish_and_clear();

    println!("info: waiting for server...");
    let (status, code) = protocol::read_code_response(&mut read_half).await?;
    match (status, code) {
        (Status::Ok, Some(code)) => {
            println!("File sent (encrypted with your key). Your code: {code} (valid 1 hour)");
            println!("Your key (the server cannot decrypt without it; keep it safe):");
            println!("  {}", hex::encode(key));
            Ok(())
        }
        (Status::Error, _) => Err("server error".into()),
        (other, _) => Err(format!("unexpected status {}", other as u8).into()),
    }
}

/// Read, seal and send the file as 256 KiB chunks, each under a fresh nonce.
async fn stream_sealed_chunks<W>(
    w: &mut W,
    file: &mut File,
    key: &[u8; KEY_SIZE],
    total: u64,
    bar: &ProgressBar,
) -> Result<(), Box<dyn Error>>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    while sent < total {
        let want = ((total - sent) as usize).min(CHUNK_SIZE);
        file.read_exact(&mut buf[..want]).await?;
        let (nonce, sealed) = cryptography::seal_chunk(key, &buf[..want])?;
        protocol::write_chunk_frame(w, &nonce, &sealed).await?;
        sent += want as u64;
        bar.set_position(sent);
    }
    Ok(())
}

/// SHA-256 of the whole file, streamed so large files never sit in memory.
async fn file_checksum(path: &Path) -> Result<[u8; 32], Box<dyn Error>> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn chunk_count(file_size: u64) -> u32 {
    file_size.div_ceil(CHUNK_SIZE as u64) as u32
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
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_count(1_048_576), 4);
    }
}
