//! Browser download page: no client needed, just the six digits.
//!
//! `GET /` serves a small form; `GET /get?code=CCCCCC` decrypts a regular
//! blob with its code-derived key and streams it as an attachment. Secure
//! blobs cannot be decrypted here (the server never sees their key), so the
//! browser is told to use the client instead. Every failure is a redirect
//! back to the form with an `err` message.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{debug, error, info};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::cryptography;
use crate::protocol;
use crate::ratelimit::RateLimiter;
use crate::store::{Store, StoredBlob};
use crate::{CHUNK_SIZE, KEY_SIZE};

const PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Download by code</title>
  <style>
    body { font-family: sans-serif; max-width: 360px; margin: 60px auto; padding: 20px; }
    h1 { font-size: 1.3em; }
    input[type="text"] { width: 100%; padding: 12px; font-size: 1.2em; letter-spacing: 0.2em; text-align: center; box-sizing: border-box; }
    button { width: 100%; margin-top: 12px; padding: 12px; font-size: 1em; cursor: pointer; }
    .error { color: #c00; margin-top: 12px; }
    .hint { color: #666; font-size: 0.9em; margin-top: 8px; }
  </style>
</head>
<body>
  <h1>Download file</h1>
  <p class="hint">Enter the 6-digit code you received.</p>
  <form action="/get" method="GET">
    <input type="text" name="code" placeholder="000000" maxlength="6" pattern="[0-9]{6}" required autofocus>
    <button type="submit">Download</button>
  </form>
  <p id="err" class="error"></p>
  <script>
    var params = new URLSearchParams(location.search);
    if (params.get('err')) document.getElementById('err').textContent = params.get('err');
  </script>
</body>
</html>
"#;

#[derive(Clone)]
struct WebState {
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
}

pub fn router(store: Arc<Store>, limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get", get(download))
        .with_state(WebState { store, limiter })
}

/// Binds `port` on every interface and serves the download page until the
/// process exits.
pub async fn run(
    port: u16,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("web download page listening on :{port}");
    serve(listener, store, limiter).await
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(store, limiter).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn index() -> Html<&'static str> {
    Html(PAGE_HTML)
}

#[derive(Deserialize)]
struct GetParams {
    code: Option<String>,
}

async fn download(
    State(state): State<WebState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<GetParams>,
) -> Response {
    if !state.limiter.allow(addr.ip()) {
        return found("/?err=Too+many+attempts.+Try+again+later.");
    }
    let code = params.code.unwrap_or_default();
    let code = code.trim();
    if !protocol::valid_code(code) {
        return found("/?err=Invalid+code+(must+be+6+digits)");
    }
    let Some(blob) = state.store.lookup(code) else {
        return found("/?err=Code+not+found+or+expired");
    };
    if blob.secure {
        return found("/?err=Secure+upload:+download+with+the+client+and+your+key");
    }

    debug!("web download for code {code} from {}", addr.ip());
    let key = cryptography::derive_code_key(code);
    let filename = protocol::sanitize_name(&blob.name).unwrap_or_else(|_| "download".to_string());

    if blob.chunked {
        stream_chunked(state.store, code.to_string(), blob, key, filename).await
    } else {
        let (Some(nonce), Some(sealed)) = (blob.nonce, blob.sealed.as_deref()) else {
            return found("/?err=Decrypt+failed");
        };
        let Ok(plaintext) = cryptography::open_chunk(&key, &nonce, sealed) else {
            return found("/?err=Decrypt+failed");
        };
        attachment(&filename, Body::from(plaintext))
    }
}

/// Decrypts `<code>.dat` frame by frame and streams the plaintext through a
/// pipe. The first frame is opened before any headers go out, so a wrong or
/// corrupted blob still gets the redirect; a failure later on can only
/// truncate the body.
async fn stream_chunked(
    store: Arc<Store>,
    code: String,
    blob: StoredBlob,
    key: [u8; KEY_SIZE],
    filename: String,
) -> Response {
    let mut df = match tokio::fs::File::open(store.data_path(&code)).await {
        Ok(df) => df,
        Err(_) => return found("/?err=Decrypt+failed"),
    };
    let first = if blob.num_chunks > 0 {
        match read_and_open_frame(&mut df, &key).await {
            Ok(plaintext) => plaintext,
            Err(_) => return found("/?err=Decrypt+failed"),
        }
    } else {
        Vec::new()
    };

    let remaining = blob.num_chunks.saturating_sub(1);
    let (mut writer, reader) = tokio::io::duplex(CHUNK_SIZE);
    tokio::spawn(async move {
        if writer.write_all(&first).await.is_err() {
            return;
        }
        for _ in 0..remaining {
            match read_and_open_frame(&mut df, &key).await {
                Ok(plaintext) => {
                    if writer.write_all(&plaintext).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("web download of {code}: {e}");
                    return;
                }
            }
        }
    });
    attachment(&filename, Body::from_stream(ReaderStream::new(reader)))
}

async fn read_and_open_frame(
    df: &mut tokio::fs::File,
    key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let (nonce, sealed) = protocol::read_chunk_frame(df, 0).await?;
    Ok(cryptography::open_chunk(key, &nonce, &sealed)?)
}

/// `302 Found` back to the form with the error in the query string.
fn found(location: &str) -> Response {
    match Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => {
            error!("build redirect: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn attachment(filename: &str, body: Body) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
    {
        Ok(response) => response,
        Err(e) => {
            error!("build download response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
