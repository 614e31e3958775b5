//! Server-list fetch and the concurrent pre-upload probe.
//!
//! The published address list maps single-digit server ids to addresses.
//! Before an upload the client probes every listed server at once: dial,
//! ask about free space, then time a small payload to rank servers by
//! throughput. The winner's id becomes the first digit of the new code, so
//! a receiver can find the same server from the code alone.

use std::error::Error;
use std::time::Instant;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::networking;
use crate::protocol::{self, MessageKind};
use crate::{FREE_BYTES_UNKNOWN, LIST_FETCH_TIMEOUT, PROBE_DEADLINE, PROBE_DIAL_TIMEOUT, PROBE_PAYLOAD_MAX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub id: u8,
    pub addr: String,
}

/// One probe verdict: where, and how fast the payload came down.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub id: u8,
    pub addr: String,
    pub bytes_per_sec: f64,
}

/// Parses the address list body: one `<id>:<host:port>` per line, `#` and
/// blank lines skipped, ids outside 0-9 ignored. A repeated id keeps the
/// later line.
pub fn parse_server_list(body: &str) -> Vec<ServerEntry> {
    let mut entries: Vec<ServerEntry> = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((id_part, addr)) = line.split_once(':') else {
            continue;
        };
        let Ok(id) = id_part.trim().parse::<u8>() else {
            continue;
        };
        if id > 9 {
            continue;
        }
        let addr = addr.trim();
        if addr.is_empty() {
            continue;
        }
        entries.retain(|e| e.id != id);
        entries.push(ServerEntry {
            id,
            addr: addr.to_string(),
        });
    }
    entries
}

/// Fetches and parses the published server list.
pub async fn fetch_server_list(url: &str) -> Result<Vec<ServerEntry>, Box<dyn Error>> {
    debug!("fetching server list from {url}");
    let client = reqwest::Client::builder()
        .timeout(LIST_FETCH_TIMEOUT)
        .build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(format!("address list fetch: HTTP {}", response.status()).into());
    }
    let body = response.text().await?;
    let entries = parse_server_list(&body);
    if entries.is_empty() {
        return Err("address list contains no servers".into());
    }
    debug!("server list has {} entr(y/ies)", entries.len());
    Ok(entries)
}

/// The listed server whose id matches the code's first digit.
pub fn server_for_code(entries: &[ServerEntry], code: &str) -> Option<ServerEntry> {
    let id = protocol::code_server_id(code)?;
    entries.iter().find(|e| e.id == id).cloned()
}

/// Probes every entry concurrently and returns the fastest server that is
/// reachable and has room for `file_size` bytes. One task per entry feeds a
/// result channel; the channel closing means every probe has reported or
/// died. `None` means no server qualified.
pub async fn pick_best_server(entries: &[ServerEntry], file_size: u64) -> Option<ProbeResult> {
    let (tx, mut rx) = mpsc::channel::<ProbeResult>(entries.len().max(1));
    for entry in entries {
        let entry = entry.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(PROBE_DEADLINE, probe_one(&entry, file_size)).await {
                Ok(Ok(result)) => {
                    let _ = tx.send(result).await;
                }
                Ok(Err(e)) => debug!("probe {} (id {}): {}", entry.addr, entry.id, e),
                Err(_) => debug!("probe {}: deadline exceeded", entry.addr),
            }
        });
    }
    drop(tx);

    let mut best: Option<ProbeResult> = None;
    while let Some(result) = rx.recv().await {
        debug!(
            "probe result: server {} at {} ({:.0} B/s)",
            result.id, result.addr, result.bytes_per_sec
        );
        if best
            .as_ref()
            .map_or(true, |b| result.bytes_per_sec > b.bytes_per_sec)
        {
            best = Some(result);
        }
    }
    best
}

/// One probe exchange: free-space check, then a timed payload read.
async fn probe_one(
    entry: &ServerEntry,
    file_size: u64,
) -> Result<ProbeResult, Box<dyn Error + Send + Sync>> {
    let mut stream = networking::dial(&entry.addr, PROBE_DIAL_TIMEOUT).await?;
    protocol::write_kind(&mut stream, MessageKind::Probe).await?;
    stream.write_u64(file_size).await?;
    stream.flush().await?;

    let free = stream.read_u64().await?;
    if free != FREE_BYTES_UNKNOWN && free < file_size {
        return Err(format!("server has {free} free bytes, need {file_size}").into());
    }
    let payload_len = stream.read_u32().await?;
    if payload_len > PROBE_PAYLOAD_MAX {
        return Err(format!("probe payload of {payload_len} bytes is over the limit").into());
    }

    let started = Instant::now();
    let mut remaining = payload_len as usize;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let n = remaining.min(buf.len());
        stream.read_exact(&mut buf[..n]).await?;
        remaining -= n;
    }
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    Ok(ProbeResult {
        id: entry.id,
        addr: entry.addr.clone(),
        bytes_per_sec: payload_len as f64 / elapsed,
    })
}
