//! A single pipelined TCP connection to a broker.
//!
//! Requests are written under the writer lock, which is also where their
//! correlation id is assigned and their pending slot queued, so the pending
//! queue is always in wire order. A dedicated reader task pops the front of
//! the queue for every response; brokers answer in order on a connection, so
//! any other correlation id means the stream is out of sync and the
//! connection is torn down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{read_frame, write_frame};
use crate::codec::{ApiKey, RequestHeader, encode_request_frame, split_response_header};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

struct Pending {
    correlation_id: i32,
    tx: oneshot::Sender<Result<Bytes>>,
}

struct Shared {
    addr: String,
    pending: StdMutex<VecDeque<Pending>>,
    closed: AtomicBool,
    last_used: StdMutex<Instant>,
}

impl Shared {
    /// Fails every waiting request and marks the connection dead.
    fn fail_all(&self, err: Error) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Pending> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        for p in drained {
            let _ = p.tx.send(Err(err.clone()));
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }
}

/// Breaks the connection when a request is dropped while its frame is being
/// written: a partial frame or an orphaned pending slot leaves the stream
/// unusable for every later request.
struct WriteGuard<'a> {
    conn: &'a Connection,
    armed: bool,
}

impl WriteGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(broker = %self.conn.shared.addr, "Request cancelled mid-write, closing connection");
            self.conn
                .shared
                .fail_all(Error::Network(std::io::ErrorKind::Interrupted));
            self.conn.abort_reader();
        }
    }
}

/// One TCP connection shared by every request to a broker.
pub struct Connection {
    shared: Arc<Shared>,
    writer: Mutex<OwnedWriteHalf>,
    next_correlation_id: AtomicI32,
    permits: Arc<Semaphore>,
    max_open_requests: usize,
    client_id: Option<String>,
    read_timeout: Duration,
    write_timeout: Duration,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `addr` within `net.dial_timeout` and starts the reader task.
    pub async fn open(addr: &str, config: &ClientConfig) -> Result<Connection> {
        let stream = timeout(config.net.dial_timeout, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            addr: addr.to_string(),
            pending: StdMutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            last_used: StdMutex::new(Instant::now()),
        });
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        tracing::debug!(broker = %addr, "Connected to broker");

        let max_open_requests = config.net.max_open_requests.max(1);
        Ok(Connection {
            shared,
            writer: Mutex::new(write_half),
            next_correlation_id: AtomicI32::new(0),
            permits: Arc::new(Semaphore::new(max_open_requests)),
            max_open_requests,
            client_id: Some(config.client_id.clone()),
            read_timeout: config.net.read_timeout,
            write_timeout: config.net.write_timeout,
            reader: StdMutex::new(Some(reader)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Whether the connection can still carry requests.
    pub fn is_alive(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Time since the last request was sent or response received.
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_used
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Sends a request and waits for its response body.
    pub async fn send(&self, api_key: ApiKey, api_version: i16, body: &[u8]) -> Result<Bytes> {
        match self.dispatch(api_key, api_version, body, true).await? {
            Some(rx) => self.await_response(rx).await,
            None => Err(Error::Closed),
        }
    }

    /// Sends a request the broker will not answer (produce with acks = 0).
    pub async fn send_oneway(&self, api_key: ApiKey, api_version: i16, body: &[u8]) -> Result<()> {
        self.dispatch(api_key, api_version, body, false).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        api_key: ApiKey,
        api_version: i16,
        body: &[u8],
        expect_response: bool,
    ) -> Result<Option<(oneshot::Receiver<Result<Bytes>>, tokio::sync::OwnedSemaphorePermit)>>
    {
        if !self.is_alive() {
            return Err(Error::Network(std::io::ErrorKind::NotConnected));
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            return Err(Error::Network(std::io::ErrorKind::NotConnected));
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader {
            api_key: api_key as i16,
            api_version,
            correlation_id,
            client_id: self.client_id.clone(),
        };
        let frame = encode_request_frame(&header, body)?;

        let rx = if expect_response {
            let (tx, rx) = oneshot::channel();
            self.shared
                .pending
                .lock()
                .map_err(|_| Error::Closed)?
                .push_back(Pending { correlation_id, tx });
            Some(rx)
        } else {
            None
        };

        tracing::debug!(
            broker = %self.shared.addr,
            api_key = %api_key,
            api_version,
            correlation_id,
            size = frame.len(),
            "Sending request"
        );

        let guard = WriteGuard {
            conn: self,
            armed: true,
        };
        let written = match timeout(self.write_timeout, write_frame(&mut *writer, &frame)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        guard.disarm();
        if let Err(e) = written {
            drop(writer);
            tracing::warn!(broker = %self.shared.addr, error = %e, "Write failed, closing connection");
            self.shared.fail_all(e.clone());
            self.abort_reader();
            return Err(e);
        }
        self.shared.touch();

        Ok(rx.map(|rx| (rx, permit)))
    }

    async fn await_response(
        &self,
        (rx, _permit): (oneshot::Receiver<Result<Bytes>>, tokio::sync::OwnedSemaphorePermit),
    ) -> Result<Bytes> {
        match timeout(self.read_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Network(std::io::ErrorKind::ConnectionAborted)),
            Err(_) => {
                tracing::warn!(
                    broker = %self.shared.addr,
                    timeout = ?self.read_timeout,
                    "Response timeout, closing connection"
                );
                let err = Error::Network(std::io::ErrorKind::TimedOut);
                self.shared.fail_all(err.clone());
                self.abort_reader();
                Err(err)
            }
        }
    }

    fn abort_reader(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    /// Stops accepting requests, waits (bounded by the read timeout) for
    /// in-flight ones, then shuts the socket down. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            self.abort_reader();
            return;
        }
        let n = u32::try_from(self.max_open_requests).unwrap_or(u32::MAX);
        let _drained = timeout(self.read_timeout, self.permits.acquire_many(n)).await;
        self.permits.close();

        {
            let mut writer = self.writer.lock().await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
        }
        self.shared.fail_all(Error::Closed);
        self.abort_reader();
        tracing::debug!(broker = %self.shared.addr, "Connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(broker = %shared.addr, "Broker closed the connection");
                shared.fail_all(Error::Network(std::io::ErrorKind::ConnectionReset));
                return;
            }
            Err(e) => {
                tracing::warn!(broker = %shared.addr, error = %e, "Read failed");
                shared.fail_all(e);
                return;
            }
        };

        let (correlation_id, body) = match split_response_header(frame) {
            Ok(parts) => parts,
            Err(e) => {
                shared.fail_all(e);
                return;
            }
        };

        let next = match shared.pending.lock() {
            Ok(mut pending) => pending.pop_front(),
            Err(_) => return,
        };
        let Some(pending) = next else {
            tracing::error!(
                broker = %shared.addr,
                correlation_id,
                "Response with no pending request"
            );
            shared.fail_all(Error::CorrelationMismatch {
                expected: -1,
                received: correlation_id,
            });
            return;
        };

        if pending.correlation_id != correlation_id {
            tracing::error!(
                broker = %shared.addr,
                expected = pending.correlation_id,
                received = correlation_id,
                "Correlation id mismatch, closing connection"
            );
            let err = Error::CorrelationMismatch {
                expected: pending.correlation_id,
                received: correlation_id,
            };
            let _ = pending.tx.send(Err(err.clone()));
            shared.fail_all(err);
            return;
        }

        shared.touch();
        // the caller may have given up already
        let _ = pending.tx.send(Ok(body));
    }
}
