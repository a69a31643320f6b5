//! Pooled connections to storage nodes, keyed by `"ip:port"`.
//!
//! `acquire` hands out an idle connection when one exists, otherwise dials a
//! new one. The returned guard derefs to the stream and puts it back in the
//! pool when dropped; callers that hit an I/O error call `discard` so a
//! broken socket never re-enters rotation. The pool lock covers only the
//! borrow and return, never the socket use itself.

use log::debug;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

use dfs_lib::{DfsError, DfsResult, NETWORK_TIMEOUT_MS};

#[derive(Debug)]
struct PoolShared {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    max_idle_per_key: usize,
}

impl PoolShared {
    fn release(&self, key: &str, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap();
        let bucket = idle.entry(key.to_string()).or_default();
        if bucket.len() < self.max_idle_per_key {
            bucket.push(stream);
        } else {
            debug!("connection pool for {} full, closing socket", key);
        }
    }
}

pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(max_idle_per_key: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(HashMap::new()),
                max_idle_per_key,
            }),
        }
    }

    pub async fn acquire(&self, ip: &str, port: u16) -> DfsResult<PooledConn> {
        let key = format!("{}:{}", ip, port);

        let reused = {
            let mut idle = self.shared.idle.lock().unwrap();
            idle.get_mut(&key).and_then(|bucket| bucket.pop())
        };
        if let Some(stream) = reused {
            return Ok(PooledConn {
                key,
                stream: Some(stream),
                pool: self.shared.clone(),
            });
        }

        let stream = tokio::time::timeout(
            Duration::from_millis(NETWORK_TIMEOUT_MS),
            TcpStream::connect(&key),
        )
        .await
        .map_err(|_| DfsError::Timeout(format!("connect {} timed out", key)))?
        .map_err(|e| DfsError::IoError(format!("connect {} failed: {}", key, e)))?;

        Ok(PooledConn {
            key,
            stream: Some(stream),
            pool: self.shared.clone(),
        })
    }

    pub fn idle_count(&self, ip: &str, port: u16) -> usize {
        let key = format!("{}:{}", ip, port);
        self.shared
            .idle
            .lock()
            .unwrap()
            .get(&key)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.shared.idle.lock().unwrap().clear();
    }
}

/// A borrowed connection. Dropping it returns the socket to the pool;
/// `discard` consumes it without returning, closing the socket.
#[derive(Debug)]
pub struct PooledConn {
    key: String,
    stream: Option<TcpStream>,
    pool: Arc<PoolShared>,
}

impl PooledConn {
    pub fn discard(mut self) {
        if self.stream.take().is_some() {
            debug!("discarding connection to {}", self.key);
        }
    }
}

impl Deref for PooledConn {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().expect("stream taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(&self.key, stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn idle_listener() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let (listener, ip, port) = idle_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                // Keep accepted sockets open so reuse is observable.
                std::mem::forget(stream);
            }
        });

        let pool = ConnectionPool::new(4);
        let conn = pool.acquire(&ip, port).await.unwrap();
        assert_eq!(pool.idle_count(&ip, port), 0);
        drop(conn);
        assert_eq!(pool.idle_count(&ip, port), 1);

        let _conn = pool.acquire(&ip, port).await.unwrap();
        assert_eq!(pool.idle_count(&ip, port), 0);
    }

    #[tokio::test]
    async fn test_discard_does_not_return_to_pool() {
        let (listener, ip, port) = idle_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                std::mem::forget(stream);
            }
        });

        let pool = ConnectionPool::new(4);
        let conn = pool.acquire(&ip, port).await.unwrap();
        conn.discard();
        assert_eq!(pool.idle_count(&ip, port), 0);
    }

    #[tokio::test]
    async fn test_pool_cap_closes_overflow() {
        let (listener, ip, port) = idle_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                std::mem::forget(stream);
            }
        });

        let pool = ConnectionPool::new(1);
        let a = pool.acquire(&ip, port).await.unwrap();
        let b = pool.acquire(&ip, port).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(&ip, port), 1);
    }

    #[tokio::test]
    async fn test_acquire_unreachable_fails() {
        // Bind then drop to get a port with nothing listening.
        let (listener, ip, port) = idle_listener().await;
        drop(listener);

        let pool = ConnectionPool::new(4);
        let err = pool.acquire(&ip, port).await.unwrap_err();
        assert!(matches!(err, DfsError::IoError(_) | DfsError::Timeout(_)));
    }
}
