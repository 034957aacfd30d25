//! UDP read/write loop pair shared by the registry server and peer endpoints

use crate::{
    codec::{Frame, RequestIdGenerator, HEADER_LEN, MAX_PAYLOAD_LEN},
    error::{CodecError, NetworkError, Result},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Receive buffer large enough for the biggest legal frame
const RECV_BUFFER_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Socket loop tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the outbound frame queue
    pub queue_capacity: usize,
    /// How long a sender waits on a full queue before giving up
    pub enqueue_timeout: Duration,
    /// Deadline for a single `send_to`
    pub write_timeout: Duration,
    /// Bounded wait of each receive, after which the shutdown flag is re-checked
    pub read_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            enqueue_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            read_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Bind a UDP socket, mapping failures to [`NetworkError::BindFailed`]
pub async fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| NetworkError::BindFailed { addr, source }.into())
}

/// Owner of the two long-lived socket tasks.
///
/// Only the tasks hold the socket, so aborting them on close releases it.
pub(crate) struct Transport {
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    shutdown: Arc<AtomicBool>,
    enqueue_timeout: Duration,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Transport {
    /// Start the read and write loops on `socket`. Every decoded inbound frame
    /// is passed to `on_frame` on the read loop, so it must not block.
    pub(crate) fn start<F>(
        socket: UdpSocket,
        local_addr: SocketAddr,
        config: &TransportConfig,
        ids: Arc<dyn RequestIdGenerator>,
        on_frame: F,
    ) -> Self
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let socket = Arc::new(socket);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (outbound, queue) = mpsc::channel(config.queue_capacity.max(1));

        let read_task = tokio::spawn(read_loop(
            socket.clone(),
            shutdown.clone(),
            config.read_poll_interval,
            on_frame,
        ));
        let write_task = tokio::spawn(write_loop(socket, queue, ids, config.write_timeout));

        Self {
            local_addr,
            outbound,
            shutdown,
            enqueue_timeout: config.enqueue_timeout,
            read_task,
            write_task,
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a frame for the write loop, waiting at most the enqueue timeout on a full queue
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::Closed.into());
        }
        if frame.data_size() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                size: frame.data_size(),
                max_size: MAX_PAYLOAD_LEN,
            }
            .into());
        }
        match self.outbound.send_timeout(frame, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(frame)) => {
                warn!(
                    request_id = frame.request_id,
                    addr = %frame.addr,
                    "outbound queue full, frame dropped"
                );
                Err(NetworkError::QueueFull {
                    duration: self.enqueue_timeout,
                }
                .into())
            },
            Err(SendTimeoutError::Closed(_)) => Err(NetworkError::Closed.into()),
        }
    }

    pub(crate) fn close(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!(addr = %self.local_addr, "closing transport");
        }
        self.read_task.abort();
        self.write_task.abort();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<F>(
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    on_frame: F,
) where
    F: Fn(Frame) + Send + Sync + 'static,
{
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    while !shutdown.load(Ordering::Acquire) {
        let received = tokio::time::timeout(poll_interval, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "UDP read failed");
                continue;
            },
            Ok(Ok(received)) => received,
        };

        match Frame::decode(&buf[..len], from) {
            Ok(frame) => {
                trace!(
                    method = ?frame.method,
                    request_id = frame.request_id,
                    from = %from,
                    size = frame.data_size(),
                    "frame received"
                );
                on_frame(frame);
            },
            Err(e) => warn!(from = %from, error = %e, "dropping undecodable datagram"),
        }
    }
    debug!("read loop stopped");
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::Receiver<Frame>,
    ids: Arc<dyn RequestIdGenerator>,
    write_timeout: Duration,
) {
    while let Some(mut frame) = queue.recv().await {
        let bytes = match frame.encode(ids.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(method = ?frame.method, addr = %frame.addr, error = %e, "encode failed");
                continue;
            },
        };

        match tokio::time::timeout(write_timeout, socket.send_to(&bytes, frame.addr)).await {
            Ok(Ok(_)) => trace!(
                method = ?frame.method,
                request_id = frame.request_id,
                to = %frame.addr,
                "frame sent"
            ),
            Ok(Err(e)) => warn!(to = %frame.addr, error = %e, "UDP write failed"),
            Err(_) => warn!(to = %frame.addr, ?write_timeout, "UDP write timed out"),
        }
    }
    debug!("write loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Method, error::GoingError};
    use tokio::time::Instant;

    fn frame() -> Frame {
        Frame::new(Method::SendMessage, &b"{}"[..], "127.0.0.1:9".parse().unwrap())
    }

    /// A transport whose writer holds the queue open without ever draining it
    /// until `release` fires
    fn stalled_transport(
        enqueue_timeout: Duration,
        release: tokio::sync::oneshot::Receiver<()>,
    ) -> Transport {
        let (outbound, mut queue) = mpsc::channel(1);
        let write_task = tokio::spawn(async move {
            let _ = release.await;
            while queue.recv().await.is_some() {}
        });
        Transport {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            outbound,
            shutdown: Arc::new(AtomicBool::new(false)),
            enqueue_timeout,
            read_task: tokio::spawn(async {}),
            write_task,
        }
    }

    #[tokio::test]
    async fn full_queue_fails_after_enqueue_timeout() {
        let (_release, gate) = tokio::sync::oneshot::channel();
        let wait = Duration::from_millis(200);
        let transport = stalled_transport(wait, gate);

        transport.enqueue(frame()).await.unwrap();

        let started = Instant::now();
        let err = transport.enqueue(frame()).await.unwrap_err();
        assert!(started.elapsed() >= wait);
        assert!(matches!(
            err,
            GoingError::Network(NetworkError::QueueFull { duration }) if duration == wait
        ));
    }

    #[tokio::test]
    async fn full_queue_accepts_frame_once_drained() {
        let (release, gate) = tokio::sync::oneshot::channel();
        let transport = stalled_transport(Duration::from_secs(5), gate);

        transport.enqueue(frame()).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = release.send(());
        });

        transport.enqueue(frame()).await.unwrap();
    }

    #[tokio::test]
    async fn closed_transport_rejects_frames() {
        let (_release, gate) = tokio::sync::oneshot::channel();
        let transport = stalled_transport(Duration::from_secs(5), gate);

        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.enqueue(frame()).await,
            Err(GoingError::Network(NetworkError::Closed))
        ));
    }
}
