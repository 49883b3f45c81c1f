//! SSH banner grabbing.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerResult {
    pub hostport: String,
    /// The TCP connect went through. The banner itself may still be empty.
    pub success: bool,
    pub banner: String,
}

/// Connect to `hostport` and read whatever the server sends first.
///
/// Only a failed connect yields `success == false`; a silent or slow server is
/// still a success with an empty banner.
pub async fn probe_banner(hostport: &str, connect_timeout: Duration, read_timeout: Duration) -> BannerResult {
    let mut res = BannerResult { hostport: hostport.to_string(), success: false, banner: String::new() };
    let mut stream = match timeout(connect_timeout, TcpStream::connect(hostport)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            trace!(hostport, error = %e, "connect failed");
            return res;
        }
        Err(_) => {
            trace!(hostport, "connect timed out");
            return res;
        }
    };
    res.success = true;

    let mut buf = vec![0u8; 256];
    if let Ok(Ok(n)) = timeout(read_timeout, stream.read(&mut buf)).await {
        res.banner = clean_banner(&buf[..n]);
    }
    res
}

fn clean_banner(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches(['\r', '\n']).to_string()
}
