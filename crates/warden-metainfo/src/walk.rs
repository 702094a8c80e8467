//! Metainfo loop.
//!
//! A single producer walks the whole pointer namespace on a periodic cycle
//! and broadcasts each pointer to every observer that joined before the
//! pass started. Passes are serialized: a new pass never starts until the
//! previous one has finished or been cancelled.
//!
//! Per pointer the loop dispatches, in order: `remote_object` (once per
//! object, on the last-segment pointer), `remote_segment` for remote
//! pointers, `inline_segment` for inline ones. Observers see pointers in
//! namespace key order; multiple observers see the same pointer in their
//! join order.
//!
//! An observer returning an error is detached for the remainder of the
//! pass and gets the error back from its `join` call; the pass itself
//! keeps going for the other observers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use warden_core::Pointer;
use warden_core::SegmentPath;

use crate::store::PointerStore;

/// Maximum queued join requests before `join` applies backpressure.
const JOIN_QUEUE_SIZE: usize = 64;

/// Errors returned to a joined observer.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum LoopError {
    /// The pass was cancelled before it finished.
    #[snafu(display("metainfo pass cancelled"))]
    Cancelled,

    /// The loop has shut down and accepts no more observers.
    #[snafu(display("metainfo loop has shut down"))]
    ShutDown,

    /// This observer returned an error and was detached from the pass.
    #[snafu(display("observer failed: {message}"))]
    Observer { message: String },

    /// The pointer store failed mid-pass; the pass was abandoned.
    #[snafu(display("pointer store failed during pass: {message}"))]
    Store { message: String },
}

/// Callbacks invoked by the loop for every pointer in a pass.
///
/// Observers use interior mutability for whatever they accumulate; the
/// caller keeps its own `Arc` to read results after `join` returns.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Called once per remote object, on its last segment.
    async fn remote_object(&self, path: &SegmentPath, pointer: &Pointer) -> anyhow::Result<()>;

    /// Called for every remote segment, including last segments.
    async fn remote_segment(&self, path: &SegmentPath, pointer: &Pointer) -> anyhow::Result<()>;

    /// Called for every inline segment.
    async fn inline_segment(&self, path: &SegmentPath, pointer: &Pointer) -> anyhow::Result<()>;
}

/// Tuning for the metainfo loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Delay between passes.
    pub interval: Duration,
    /// Pointers fetched per store page.
    pub page_size: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            interval: Duration::from_secs(30),
            page_size: 1000,
        }
    }
}

struct JoinRequest {
    observer: Arc<dyn Observer>,
    done: oneshot::Sender<Result<(), LoopError>>,
}

/// Handle for joining observers onto the pointer loop.
#[derive(Clone)]
pub struct MetainfoLoop {
    join_tx: mpsc::Sender<JoinRequest>,
}

impl MetainfoLoop {
    /// Start the loop task. The returned handle is cheap to clone.
    pub fn spawn(
        store: Arc<dyn PointerStore>,
        config: LoopConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (join_tx, join_rx) = mpsc::channel(JOIN_QUEUE_SIZE);
        let task = tokio::spawn(run_loop(store, config, join_rx, cancel));
        (MetainfoLoop { join_tx }, task)
    }

    /// Join the next pass and wait for it to complete.
    ///
    /// Returns when the pass that included this observer has finished; the
    /// result is this observer's own outcome, independent of the others.
    pub async fn join(&self, observer: Arc<dyn Observer>) -> Result<(), LoopError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.join_tx
            .send(JoinRequest {
                observer,
                done: done_tx,
            })
            .await
            .map_err(|_| LoopError::ShutDown)?;
        done_rx.await.map_err(|_| LoopError::ShutDown)?
    }
}

struct Participant {
    observer: Arc<dyn Observer>,
    done: oneshot::Sender<Result<(), LoopError>>,
    failed: Option<LoopError>,
}

async fn run_loop(
    store: Arc<dyn PointerStore>,
    config: LoopConfig,
    mut join_rx: mpsc::Receiver<JoinRequest>,
    cancel: CancellationToken,
) {
    info!(interval_secs = config.interval.as_secs(), "metainfo loop started");

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending: Vec<JoinRequest> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                for request in pending.drain(..) {
                    let _ = request.done.send(Err(LoopError::Cancelled));
                }
                info!("metainfo loop shutting down");
                return;
            }

            Some(request) = join_rx.recv() => {
                pending.push(request);
            }

            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let participants = pending
                    .drain(..)
                    .map(|request| Participant {
                        observer: request.observer,
                        done: request.done,
                        failed: None,
                    })
                    .collect();
                run_pass(&store, &config, participants, &cancel).await;
            }
        }
    }
}

async fn run_pass(
    store: &Arc<dyn PointerStore>,
    config: &LoopConfig,
    mut participants: Vec<Participant>,
    cancel: &CancellationToken,
) {
    debug!(observers = participants.len(), "metainfo pass starting");

    let mut last: Option<SegmentPath> = None;
    let mut pointers = 0u64;

    'pass: loop {
        let page = match store.list_after(last.as_ref(), config.page_size).await {
            Ok(page) => page,
            Err(error) => {
                warn!(%error, "metainfo pass abandoned: pointer store failed");
                let message = error.to_string();
                for participant in participants {
                    let _ = participant.done.send(Err(LoopError::Store {
                        message: message.clone(),
                    }));
                }
                return;
            }
        };
        if page.is_empty() {
            break 'pass;
        }
        last = page.last().map(|(path, _)| path.clone());

        for (path, pointer) in page {
            // cooperative cancellation at pointer boundaries
            if cancel.is_cancelled() {
                for participant in participants {
                    let _ = participant.done.send(Err(LoopError::Cancelled));
                }
                debug!(pointers, "metainfo pass cancelled");
                return;
            }

            for participant in participants.iter_mut() {
                if participant.failed.is_some() {
                    continue;
                }
                if let Err(error) = dispatch(participant.observer.as_ref(), &path, &pointer).await {
                    warn!(path = %path, %error, "observer failed, detaching from pass");
                    participant.failed = Some(LoopError::Observer {
                        message: error.to_string(),
                    });
                }
            }
            pointers += 1;
        }
    }

    debug!(pointers, "metainfo pass finished");
    for participant in participants {
        let result = match participant.failed {
            Some(error) => Err(error),
            None => Ok(()),
        };
        let _ = participant.done.send(result);
    }
}

async fn dispatch(
    observer: &dyn Observer,
    path: &SegmentPath,
    pointer: &Pointer,
) -> anyhow::Result<()> {
    if pointer.is_remote() {
        if path.is_last_segment() {
            observer.remote_object(path, pointer).await?;
        }
        observer.remote_segment(path, pointer).await?;
    } else {
        observer.inline_segment(path, pointer).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parking_lot::Mutex;

    use warden_core::NodeId;
    use warden_core::PieceId;
    use warden_core::RedundancyScheme;
    use warden_core::RemotePiece;
    use warden_core::RemoteSegment;
    use warden_core::Segment;

    use crate::store::MemoryPointerStore;

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl Observer for RecordingObserver {
        async fn remote_object(&self, path: &SegmentPath, _: &Pointer) -> anyhow::Result<()> {
            self.events.lock().push(format!("object:{path}"));
            Ok(())
        }

        async fn remote_segment(&self, path: &SegmentPath, _: &Pointer) -> anyhow::Result<()> {
            if self.fail_on.as_deref() == Some(path.as_str()) {
                anyhow::bail!("boom at {path}");
            }
            self.events.lock().push(format!("remote:{path}"));
            Ok(())
        }

        async fn inline_segment(&self, path: &SegmentPath, _: &Pointer) -> anyhow::Result<()> {
            self.events.lock().push(format!("inline:{path}"));
            Ok(())
        }
    }

    fn remote_pointer() -> Pointer {
        Pointer {
            segment: Segment::Remote(RemoteSegment {
                root_piece_id: PieceId([9u8; 32]),
                redundancy: RedundancyScheme::new(1, 1, 1, 2, 64),
                pieces: vec![RemotePiece {
                    piece_num: 0,
                    node_id: NodeId([1u8; 32]),
                    hash: None,
                }],
            }),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: 64,
            metadata: Vec::new(),
        }
    }

    fn inline_pointer() -> Pointer {
        Pointer {
            segment: Segment::Inline(b"x".to_vec()),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: 1,
            metadata: Vec::new(),
        }
    }

    async fn seeded_store() -> Arc<MemoryPointerStore> {
        let store = Arc::new(MemoryPointerStore::new());
        store
            .put(&SegmentPath::from("p/l/b/obj"), remote_pointer())
            .await
            .unwrap();
        store
            .put(&SegmentPath::from("p/s0/b/obj"), remote_pointer())
            .await
            .unwrap();
        store
            .put(&SegmentPath::from("p/s1/b/obj"), inline_pointer())
            .await
            .unwrap();
        store
    }

    fn fast_config() -> LoopConfig {
        LoopConfig {
            interval: Duration::from_millis(10),
            page_size: 2,
        }
    }

    #[tokio::test]
    async fn pass_dispatches_in_key_order() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();
        let (metainfo_loop, task) = MetainfoLoop::spawn(store, fast_config(), cancel.clone());

        let observer = Arc::new(RecordingObserver::default());
        metainfo_loop.join(Arc::clone(&observer) as Arc<dyn Observer>).await.unwrap();

        assert_eq!(
            observer.events(),
            vec![
                "object:p/l/b/obj".to_string(),
                "remote:p/l/b/obj".to_string(),
                "remote:p/s0/b/obj".to_string(),
                "inline:p/s1/b/obj".to_string(),
            ]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failing_observer_is_isolated() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();
        let (metainfo_loop, task) = MetainfoLoop::spawn(store, fast_config(), cancel.clone());

        let healthy = Arc::new(RecordingObserver::default());
        let failing = Arc::new(RecordingObserver {
            events: Mutex::new(Vec::new()),
            fail_on: Some("p/l/b/obj".to_string()),
        });

        let healthy_join = metainfo_loop.join(Arc::clone(&healthy) as Arc<dyn Observer>);
        let failing_join = metainfo_loop.join(Arc::clone(&failing) as Arc<dyn Observer>);
        let (healthy_result, failing_result) = tokio::join!(healthy_join, failing_join);

        // the failing observer got its error back, the healthy one ran the
        // whole pass
        assert!(matches!(failing_result, Err(LoopError::Observer { .. })));
        healthy_result.unwrap();
        assert_eq!(healthy.events().len(), 4);
        // the failing observer saw nothing after its error
        assert_eq!(failing.events(), vec!["object:p/l/b/obj".to_string()]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn join_after_shutdown_errors() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();
        let (metainfo_loop, task) = MetainfoLoop::spawn(store, fast_config(), cancel.clone());

        cancel.cancel();
        task.await.unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let result = metainfo_loop.join(observer as Arc<dyn Observer>).await;
        assert!(matches!(result, Err(LoopError::ShutDown) | Err(LoopError::Cancelled)));
    }
}
