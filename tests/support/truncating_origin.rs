//! Hand-written HTTP/1.1 origin whose first full GET dies mid-body.
//!
//! wiremock always sends complete bodies, so interrupted transfers need a
//! raw socket. Every response carries `Connection: close`, one request per
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::socket_guard::bind_loopback_or_skip;
use super::{RequestLog, SeenRequest, parse_range};

/// Serves `body`, cutting the first plain GET off after `cut_after` bytes.
pub struct TruncatingOrigin {
    base: String,
    log: RequestLog,
    task: JoinHandle<()>,
}

impl TruncatingOrigin {
    /// Starts the origin, or returns `None` when loopback is unavailable.
    pub async fn start(body: Vec<u8>, cut_after: usize) -> Option<Self> {
        let listener = bind_loopback_or_skip().await?;
        let base = format!("http://{}", listener.local_addr().ok()?);
        let log = RequestLog::default();
        let task = tokio::spawn(serve(
            listener,
            Arc::new(body),
            cut_after,
            log.clone(),
        ));
        Some(Self { base, log, task })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn log(&self) -> RequestLog {
        self.log.clone()
    }
}

impl Drop for TruncatingOrigin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, body: Arc<Vec<u8>>, cut_after: usize, log: RequestLog) {
    let cut_pending = Arc::new(AtomicBool::new(true));
    while let Ok((stream, _)) = listener.accept().await {
        let body = Arc::clone(&body);
        let cut_pending = Arc::clone(&cut_pending);
        let log = log.clone();
        tokio::spawn(async move {
            let _ = answer(stream, &body, cut_after, &cut_pending, &log).await;
        });
    }
}

async fn answer(
    stream: TcpStream,
    body: &[u8],
    cut_after: usize,
    cut_pending: &AtomicBool,
    log: &RequestLog,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }
    log.push(SeenRequest {
        method: method.clone(),
        range: range.clone(),
    });

    let total = body.len();
    let mut stream = reader.into_inner();
    if method == "HEAD" {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\
             Connection: close\r\n\r\n"
        );
        stream.write_all(head.as_bytes()).await?;
        return stream.shutdown().await;
    }

    match range.as_deref().and_then(parse_range) {
        Some((start, _)) if start < total => {
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\
                 Content-Range: bytes {start}-{}/{total}\r\nAccept-Ranges: bytes\r\n\
                 Connection: close\r\n\r\n",
                total - start,
                total - 1
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body[start..]).await?;
        }
        _ => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\
                 Connection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
            let sent = if cut_pending.swap(false, Ordering::SeqCst) {
                &body[..cut_after.min(total)]
            } else {
                body
            };
            stream.write_all(sent).await?;
        }
    }
    stream.flush().await?;
    stream.shutdown().await
}
