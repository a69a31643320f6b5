//! The client's channel to the directory service.
//!
//! One lazily-dialed connection, owned behind an async lock so request and
//! response stay paired. Every failure tears the connection down and retries
//! with exponential backoff; running out of attempts surfaces as
//! `DirectoryUnreachable`.

use log::{debug, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use dfs_lib::{recv_frame, send_frame, DfsError, DfsResult, Frame, NETWORK_TIMEOUT_MS};

pub(crate) struct DirectoryChannel {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl DirectoryChannel {
    pub(crate) fn new(ip: &str, port: u16, retry_attempts: u32, retry_backoff: Duration) -> Self {
        Self {
            addr: format!("{}:{}", ip, port),
            conn: Mutex::new(None),
            retry_attempts: retry_attempts.max(1),
            retry_backoff,
        }
    }

    pub(crate) async fn call(&self, request: &Frame) -> DfsResult<Frame> {
        let mut conn = self.conn.lock().await;
        let mut delay = self.retry_backoff;
        let mut last_error = DfsError::DirectoryUnreachable(self.addr.clone());

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            if conn.is_none() {
                match self.connect().await {
                    Ok(stream) => *conn = Some(stream),
                    Err(e) => {
                        debug!("directory {}: connect failed: {}", self.addr, e);
                        last_error = e;
                        continue;
                    }
                }
            }
            let stream = match conn.as_mut() {
                Some(stream) => stream,
                None => continue,
            };

            let exchange = async {
                send_frame(stream, request).await?;
                recv_frame(stream).await
            };
            match exchange.await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!("directory {}: request failed: {}", self.addr, e);
                    *conn = None;
                    last_error = e;
                }
            }
        }

        Err(DfsError::DirectoryUnreachable(format!(
            "{} after {} attempts: {}",
            self.addr, self.retry_attempts, last_error
        )))
    }

    async fn connect(&self) -> DfsResult<TcpStream> {
        tokio::time::timeout(
            Duration::from_millis(NETWORK_TIMEOUT_MS),
            TcpStream::connect(&self.addr),
        )
        .await
        .map_err(|_| DfsError::Timeout(format!("connect {} timed out", self.addr)))?
        .map_err(|e| DfsError::IoError(format!("connect {} failed: {}", self.addr, e)))
    }
}
