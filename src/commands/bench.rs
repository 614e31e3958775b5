use std::error::Error;
use std::time::Instant;

use indicatif::HumanBytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::networking;
use crate::probe;
use crate::protocol::{self, MessageKind};
use crate::{ADDRESS_LIST_URL, BENCH_BLOCK_SIZE, BENCH_PHASE_DURATION, BUF_SIZE, DIAL_TIMEOUT};

/// Measure throughput to a server: the server streams to us for roughly ten
/// seconds, we stream back for the same, and both byte counts are printed.
pub async fn run(addr: Option<String>) -> Result<(), Box<dyn Error>> {
    let addr = match addr {
        Some(addr) => addr,
        None => {
            let entries = probe::fetch_server_list(ADDRESS_LIST_URL).await?;
            entries.first().ok_or("no server available")?.addr.clone()
        }
    };
    println!("info: benchmarking {addr} (roughly ten seconds each way)");

    let stream = networking::dial(&addr, DIAL_TIMEOUT).await?;
    let (read_half, write_half) = stream.into_split();
    let mut r = BufReader::with_capacity(BUF_SIZE, read_half);
    let mut w = BufWriter::with_capacity(BUF_SIZE, write_half);
    protocol::write_kind(&mut w, MessageKind::Bench).await?;
    w.flush().await?;

    // Download phase: count length-prefixed blocks until the zero marker.
    let started = Instant::now();
    let mut downloaded: u64 = 0;
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
        downloaded += len as u64;
    }
    let down_secs = started.elapsed().as_secs_f64().max(1e-6);

    // Upload phase: stream blocks back, then the zero marker.
    let block = vec![0u8; BENCH_BLOCK_SIZE];
    let started = Instant::now();
    let mut uploaded: u64 = 0;
    while started.elapsed() < BENCH_PHASE_DURATION {
        w.write_u32(block.len() as u32).await?;
        w.write_all(&block).await?;
        uploaded += block.len() as u64;
    }
    w.write_u32(0).await?;
    w.flush().await?;
    let up_secs = started.elapsed().as_secs_f64().max(1e-6);
    let confirmed = r.read_u64().await?;

    println!(
        "Download: {} in {down_secs:.1}s ({}/s)",
        HumanBytes(downloaded),
        HumanBytes((downloaded as f64 / down_secs) as u64),
    );
    println!(
        "Upload:   {} in {up_secs:.1}s ({}/s, server counted {})",
        HumanBytes(uploaded),
        HumanBytes((uploaded as f64 / up_secs) as u64),
        HumanBytes(confirmed),
    );
    Ok(())
}
