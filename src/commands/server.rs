use std::error::Error;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::ratelimit::RateLimiter;
use crate::server::{self, ServerConfig};
use crate::store::Store;
use crate::web;
use crate::{
    BAN_DURATION, CLEANUP_INTERVAL, MAX_BLOB_SIZE, RATE_LIMIT_ATTEMPTS, RATE_LIMIT_WINDOW,
    STORAGE_DURATION,
};

/// Run the relay server.
///
/// # Process Flow
/// 1. Open the blob store (recovers orphans and sweeps expired blobs)
/// 2. Spawn the periodic expiry sweeper
/// 3. Optionally spawn the browser download page
/// 4. Accept TCP connections forever, one handler task each
///
/// # Arguments
/// * `port` - TCP port for the binary protocol
/// * `dir` - Directory for stored encrypted blobs
/// * `web_port` - Port for the browser download page; `None` disables it
/// * `server_id` - This server's digit (0-9) in the published address list
pub async fn run(
    port: u16,
    dir: &str,
    web_port: Option<u16>,
    server_id: u8,
) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(Store::open(dir, STORAGE_DURATION)?);
    let limiter = Arc::new(RateLimiter::new(
        RATE_LIMIT_ATTEMPTS,
        RATE_LIMIT_WINDOW,
        BAN_DURATION,
    ));

    {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            // The first tick completes immediately; skip it so sweeps start
            // one interval from now.
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!("expired {removed} blob(s)");
                }
            }
        });
    }

    if let Some(web_port) = web_port {
        let store = Arc::clone(&store);
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            if let Err(e) = web::run(web_port, store, limiter).await {
                error!("web server: {e}");
            }
        });
        println!(
            "codedrop server: web download page on :{web_port} (open in browser, enter code to download)"
        );
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!(
        "codedrop server: id {server_id}, listening on :{port}, data dir {dir}, blobs kept {:?}, max {} MB, rate limit {}/{:?} then {:?} ban",
        STORAGE_DURATION,
        MAX_BLOB_SIZE / (1024 * 1024),
        RATE_LIMIT_ATTEMPTS,
        RATE_LIMIT_WINDOW,
        BAN_DURATION,
    );
    info!("server started on port {port}");

    server::run(
        listener,
        store,
        limiter,
        ServerConfig {
            server_id,
            max_blob_size: MAX_BLOB_SIZE,
        },
    )
    .await;
    Ok(())
}
