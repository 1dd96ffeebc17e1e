//! Peer side of the hub connection.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use deltasync_core::wire::{Envelope, FileDelta};
use deltasync_services::{ApplyOutcome, SyncEngine};

use crate::transport::{self, Frame, FrameSink, FrameSource};

pub struct PeerClient {
    engine: Arc<SyncEngine>,
    url: String,
    token: String,
}

impl PeerClient {
    pub fn new(engine: Arc<SyncEngine>, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            engine,
            url: url.into(),
            token: token.into(),
        }
    }

    /// Dial the hub and run the session. Returns `Ok` on local shutdown and
    /// an error when the hub goes away.
    pub async fn run(&self, local: mpsc::Receiver<FileDelta>, shutdown: CancellationToken) -> Result<()> {
        let (source, sink) = transport::connect(&self.url).await?;
        tracing::info!(url = %self.url, "connected to hub");
        self.run_with(source, sink, local, shutdown).await
    }

    /// Run a session over an already-open connection.
    pub async fn run_with<Src, Snk>(
        &self,
        mut source: Src,
        mut sink: Snk,
        mut local: mpsc::Receiver<FileDelta>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        Src: FrameSource,
        Snk: FrameSink,
    {
        sink.send(Frame::Text(self.token.clone())).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delta = local.recv() => {
                    let Some(delta) = delta else { break };
                    tracing::debug!(path = %delta.path, "sending local delta");
                    let frame = Envelope::FileDelta(delta).encode()?;
                    sink.send(Frame::Binary(frame)).await?;
                }
                frame = source.recv() => match frame {
                    None | Some(Ok(Frame::Close)) => bail!("hub closed the connection"),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Frame::Ping(data))) => sink.send(Frame::Pong(data)).await?,
                    Some(Ok(Frame::Binary(data))) => {
                        if let Some(reply) = self.handle(&data).await {
                            sink.send(Frame::Binary(reply.encode()?)).await?;
                        }
                    }
                    Some(Ok(Frame::Pong(_) | Frame::Text(_))) => {}
                },
            }
        }

        let _ = sink.close().await;
        tracing::info!("hub session closed");
        Ok(())
    }

    /// Apply one message from the hub. Returns a message to send back, if
    /// any.
    async fn handle(&self, data: &[u8]) -> Option<Envelope> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame from hub");
                return None;
            }
        };

        match envelope {
            Envelope::StartProjectSync { file_count } => {
                tracing::info!(file_count, "initial sync started");
            }
            Envelope::EndProjectSync => tracing::info!("initial sync complete"),
            Envelope::InitialSyncFile(file) => {
                if let Err(e) = self.engine.apply_initial_file(&file).await {
                    tracing::warn!(path = %file.path, error = %e, "could not apply file from hub");
                }
            }
            Envelope::FileDelta(delta) => match self.engine.on_remote_delta(&delta).await {
                Ok(ApplyOutcome::Applied | ApplyOutcome::Echo) => {}
                Err(e) if e.needs_resync() => {
                    tracing::warn!(path = %delta.path, error = %e, "delta rejected, requesting full copy");
                    return Some(Envelope::ResyncRequest { path: delta.path });
                }
                Err(e) => tracing::warn!(path = %delta.path, error = %e, "could not apply delta"),
            },
            other => tracing::warn!(kind = other.kind(), "unexpected message from hub"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{pair, TestConn};
    use bytes::Bytes;
    use deltasync_core::wire::InitialSyncFile;
    use deltasync_core::{ChunkParams, FileManifest};
    use deltasync_services::delta::diff;
    use deltasync_services::LocalFs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_root() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("deltasync-client-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn params() -> ChunkParams {
        ChunkParams::new(64, 256, 1024).unwrap()
    }

    struct Session {
        conn: TestConn,
        local: mpsc::Sender<FileDelta>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
        engine: Arc<SyncEngine>,
        root: PathBuf,
    }

    async fn start() -> Session {
        let root = temp_root();
        let fs = LocalFs::new(&root, vec![".snap".into()]).unwrap();
        let engine = Arc::new(
            SyncEngine::open(Arc::new(fs), params(), root.join(".snap"))
                .await
                .unwrap(),
        );
        let client = PeerClient::new(engine.clone(), "ws://unused", "otp-123");
        let (source, sink, conn) = pair();
        let (local, local_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { client.run_with(source, sink, local_rx, token).await });
        Session {
            conn,
            local,
            shutdown,
            task,
            engine,
            root,
        }
    }

    async fn next_frame(conn: &mut TestConn) -> Frame {
        timeout(Duration::from_secs(2), conn.outbound.recv())
            .await
            .expect("timed out")
            .expect("client hung up")
    }

    fn push(conn: &TestConn, envelope: Envelope) {
        conn.inbound
            .send(Ok(Frame::Binary(envelope.encode().unwrap())))
            .unwrap();
    }

    #[tokio::test]
    async fn presents_token_then_applies_initial_sync() {
        let mut s = start().await;
        assert_eq!(next_frame(&mut s.conn).await, Frame::Text("otp-123".into()));

        let manifest = FileManifest::from_bytes(b"hello from the host", &params());
        push(&s.conn, Envelope::StartProjectSync { file_count: 1 });
        push(
            &s.conn,
            Envelope::InitialSyncFile(InitialSyncFile {
                path: "src/lib.rs".into(),
                manifest,
            }),
        );
        push(&s.conn, Envelope::EndProjectSync);

        // A ping after the batch doubles as a barrier.
        s.conn.inbound.send(Ok(Frame::Ping(Bytes::from_static(b"k")))).unwrap();
        assert_eq!(next_frame(&mut s.conn).await, Frame::Pong(Bytes::from_static(b"k")));
        assert_eq!(
            std::fs::read(s.root.join("src/lib.rs")).unwrap(),
            b"hello from the host"
        );
        assert_eq!(s.engine.tracked_files().await, 1);

        s.shutdown.cancel();
        s.task.await.unwrap().unwrap();
        assert!(s.conn.closed.load(Ordering::SeqCst));
        let _ = std::fs::remove_dir_all(&s.root);
    }

    #[tokio::test]
    async fn local_deltas_are_forwarded() {
        let mut s = start().await;
        next_frame(&mut s.conn).await;

        let delta = s
            .engine
            .submit_local_change("notes.md", Bytes::from_static(b"peer edit"))
            .await
            .unwrap()
            .unwrap();
        s.local.send(delta.clone()).await.unwrap();

        match next_frame(&mut s.conn).await {
            Frame::Binary(data) => assert_eq!(Envelope::decode(&data).unwrap(), Envelope::FileDelta(delta)),
            other => panic!("unexpected frame {other:?}"),
        }
        s.shutdown.cancel();
        s.task.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&s.root);
    }

    #[tokio::test]
    async fn unusable_delta_requests_resync() {
        let mut s = start().await;
        next_frame(&mut s.conn).await;

        let base = FileManifest::from_bytes(b"a base this peer never had", &params());
        let edited = FileManifest::from_bytes(b"an edit on top of that base", &params());
        push(
            &s.conn,
            Envelope::FileDelta(diff("doc.txt", Some(&base), &edited).unwrap()),
        );

        match next_frame(&mut s.conn).await {
            Frame::Binary(data) => assert_eq!(
                Envelope::decode(&data).unwrap(),
                Envelope::ResyncRequest { path: "doc.txt".into() }
            ),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(!s.root.join("doc.txt").exists());
        s.shutdown.cancel();
        s.task.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&s.root);
    }

    #[tokio::test]
    async fn hub_hangup_is_an_error() {
        let mut s = start().await;
        next_frame(&mut s.conn).await;
        s.conn.inbound.send(Ok(Frame::Close)).unwrap();
        assert!(s.task.await.unwrap().is_err());
        let _ = std::fs::remove_dir_all(&s.root);
    }
}
