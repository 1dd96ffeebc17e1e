//! Per-connection tasks: handshake, reader, writer.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use deltasync_core::wire::Envelope;

use super::{now_unix_ms, Hub, Origin, Outbound, PeerHandle, PeerId};
use crate::transport::{Frame, FrameSink, FrameSource};

/// How long the writer waits for a close frame to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

impl Hub {
    /// Drive one accepted connection until it closes, is evicted, or the
    /// hub shuts down.
    ///
    /// The first frame must be a text frame carrying a credential the
    /// validator accepts, and must arrive within the handshake timeout.
    pub async fn accept<Src, Snk>(&self, mut source: Src, mut sink: Snk, addr: String)
    where
        Src: FrameSource + 'static,
        Snk: FrameSink + 'static,
    {
        let settings = self.settings().clone();

        let credential = match tokio::time::timeout(settings.handshake_timeout, source.recv()).await {
            Ok(Some(Ok(Frame::Text(text)))) => text,
            Ok(Some(Ok(other))) => {
                tracing::warn!(addr = %addr, frame = frame_kind(&other), "handshake expected a text frame");
                let _ = sink.close().await;
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(addr = %addr, error = %e, "read failed during handshake");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(addr = %addr, "handshake timed out");
                let _ = sink.close().await;
                return;
            }
        };
        if !self.shared.validator.validate(credential.trim()) {
            tracing::warn!(addr = %addr, "handshake rejected: bad credential");
            let _ = sink.close().await;
            return;
        }

        let id: PeerId = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let close = self.shared.shutdown.child_token();
        let (outbound, queue) = mpsc::channel(settings.peer_queue_capacity);

        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            close.clone(),
            settings.ping_interval,
            id,
        ));

        let handle = PeerHandle {
            id,
            addr: addr.clone(),
            outbound,
            close: close.clone(),
            joined_at_unix_ms: now_unix_ms(),
        };
        if self.shared.register_tx.send(handle).await.is_err() {
            close.cancel();
            let _ = writer.await;
            return;
        }
        tracing::debug!(peer = id, addr = %addr, "handshake complete");

        self.read_loop(&mut source, id, &close, settings.pong_wait).await;

        close.cancel();
        let _ = self.shared.unregister_tx.send(id).await;
        let _ = writer.await;
        tracing::debug!(peer = id, "connection finished");
    }

    async fn read_loop<Src: FrameSource>(
        &self,
        source: &mut Src,
        id: PeerId,
        close: &CancellationToken,
        pong_wait: Duration,
    ) {
        let mut deadline = Instant::now() + pong_wait;
        loop {
            tokio::select! {
                _ = close.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(peer = id, "no pong before deadline, dropping peer");
                    break;
                }
                frame = source.recv() => match frame {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = id, error = %e, "read failed");
                        break;
                    }
                    Some(Ok(Frame::Close)) => break,
                    Some(Ok(Frame::Pong(_))) => deadline = Instant::now() + pong_wait,
                    Some(Ok(Frame::Ping(_))) => {}
                    Some(Ok(Frame::Text(_))) => {
                        tracing::warn!(peer = id, "unexpected text frame, ignoring");
                    }
                    Some(Ok(Frame::Binary(data))) => match Envelope::decode(&data) {
                        Ok(envelope) => {
                            if self.dispatch(Origin::Peer(id), envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = id, error = %e, "dropping undecodable frame");
                        }
                    },
                },
            }
        }
    }
}

/// Sole writer for one connection. Drains the outbound queue and sends a
/// ping every `ping_interval`; every write is abandoned as soon as the
/// peer is cancelled, so a stalled socket cannot hold the task.
async fn write_loop<Snk: FrameSink>(
    mut sink: Snk,
    mut queue: mpsc::Receiver<Outbound>,
    close: CancellationToken,
    ping_interval: Duration,
    id: PeerId,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'conn: loop {
        let frames = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            item = queue.recv() => match item {
                None => break,
                Some(Outbound::Frame(data)) => vec![Frame::Binary(data)],
                Some(Outbound::Batch(batch)) => batch.into_iter().map(Frame::Binary).collect(),
            },
            _ = ticker.tick() => vec![Frame::Ping(Bytes::new())],
        };
        for frame in frames {
            tokio::select! {
                biased;
                _ = close.cancelled() => break 'conn,
                res = sink.send(frame) => {
                    if let Err(e) = res {
                        tracing::debug!(peer = id, error = %e, "write failed");
                        break 'conn;
                    }
                }
            }
        }
    }

    close.cancel();
    if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        tracing::debug!(peer = id, "close did not flush in time");
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Text(_) => "text",
        Frame::Binary(_) => "binary",
        Frame::Ping(_) => "ping",
        Frame::Pong(_) => "pong",
        Frame::Close => "close",
    }
}
