use std::io;
use std::time::Duration;

use log::debug;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect to `addr` within `dial_timeout` and enlarge the socket buffers
/// for high bandwidth-delay links.
pub async fn dial(addr: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
    debug!("dialing {} (timeout {:?})", addr, dial_timeout);
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
        })??;
    set_tcp_buffers(&stream);
    Ok(stream)
}

/// Ask the kernel for large send/receive buffers. Best-effort: the kernel
/// may clamp the value, and platforms without the knob are skipped.
#[cfg(unix)]
pub fn set_tcp_buffers(stream: &TcpStream) {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let size = crate::TCP_BUFFER_SIZE as libc::c_int;
    let len = std::mem::size_of_val(&size) as libc::socklen_t;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            len,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            len,
        );
    }
}

#[cfg(not(unix))]
pub fn set_tcp_buffers(_stream: &TcpStream) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = dial(&addr.to_string(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        // Reserved TEST-NET-1 address; nothing answers there.
        let result = dial("192.0.2.1:9", Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
