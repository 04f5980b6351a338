//! Ordered delivery of execution events to the single observer.
//!
//! Producers append frames without ever blocking on space. One delivery task drains
//! the queue head-first into whichever connection last sent `listen`. A frame leaves
//! the queue only after it has been written completely, so an observer that goes
//! away mid-stream costs nothing but a possible repeat of the frame it was writing.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cancel::Scope;
use crate::transport::{FrameWriter, SessionId};
use crate::wire;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

struct Observer {
    session: SessionId,
    writer: FrameWriter,
    scope: Scope,
}

enum Step {
    Delivered,
    Idle,
}

pub struct DeliveryQueue {
    frames: Mutex<VecDeque<Bytes>>,
    observer: tokio::sync::Mutex<Option<Observer>>,
    wake: Notify,
    write_timeout: Duration,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// An observer that cannot accept a frame within `write_timeout` is dropped.
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            observer: tokio::sync::Mutex::new(None),
            wake: Notify::new(),
            write_timeout,
        }
    }

    fn lock_frames(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, frame: Bytes) {
        self.enqueue_all([frame]);
    }

    /// Appends the frames as one contiguous run.
    pub fn enqueue_all<I>(&self, frames: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut queue = self.lock_frames();
        let was_empty = queue.is_empty();
        queue.extend(frames);
        // Signal under the lock; a pending permit already covers this wake-up.
        if was_empty && !queue.is_empty() {
            self.wake.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock_frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes `writer` the delivery target and acknowledges with `ok\0`.
    ///
    /// A previous observer on another session is closed. The acknowledgement is
    /// written before any queued frame reaches the new observer.
    pub async fn register_observer(
        &self,
        session: SessionId,
        writer: FrameWriter,
        scope: Scope,
    ) -> std::io::Result<()> {
        let mut observer = self.observer.lock().await;
        if let Some(previous) = observer.take() {
            if previous.session != session {
                log::info!(
                    "Observer {} replaced by {}, closing it",
                    previous.session,
                    session
                );
                previous.scope.cancel();
            }
        }
        writer.send(wire::STATUS_OK).await?;
        log::info!("Session {} is now the observer", session);
        *observer = Some(Observer {
            session,
            writer,
            scope,
        });
        drop(observer);
        self.wake.notify_one();
        Ok(())
    }

    /// Clears the observer if it belongs to `session`.
    pub async fn unregister_observer(&self, session: &SessionId) -> bool {
        let mut observer = self.observer.lock().await;
        match observer.as_ref() {
            Some(current) if &current.session == session => {
                *observer = None;
                log::info!("Observer {} left", session);
                true
            }
            _ => false,
        }
    }

    pub async fn observer_session(&self) -> Option<SessionId> {
        self.observer
            .lock()
            .await
            .as_ref()
            .map(|observer| observer.session.clone())
    }

    /// Runs the delivery loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: Scope) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Armed before the emptiness check so a concurrent enqueue cannot slip by.
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                break;
            }
            match self.step().await {
                Step::Delivered => continue,
                Step::Idle => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = &mut notified => {}
                    }
                }
            }
        }
        log::debug!("Delivery loop stopped with {} frame(s) pending", self.len());
    }

    pub fn spawn(self: &Arc<Self>, shutdown: Scope) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(shutdown).await })
    }

    /// Writes the head frame to the observer. Observer lock is held across the write so
    /// a replacement cannot interleave with a half-written frame.
    async fn step(&self) -> Step {
        let mut observer = self.observer.lock().await;
        let Some(current) = observer.as_ref() else {
            return Step::Idle;
        };
        let Some(head) = self.lock_frames().front().cloned() else {
            return Step::Idle;
        };

        let outcome = tokio::time::timeout(self.write_timeout, current.writer.send(&head)).await;
        match outcome {
            Ok(Ok(())) => {
                self.lock_frames().pop_front();
                Step::Delivered
            }
            Ok(Err(e)) => {
                log::warn!("Delivery to observer {} failed: {}", current.session, e);
                current.scope.cancel();
                *observer = None;
                Step::Delivered
            }
            Err(_) => {
                log::warn!(
                    "Observer {} stalled for {:?}, dropping it",
                    current.session,
                    self.write_timeout
                );
                current.scope.cancel();
                *observer = None;
                Step::Delivered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ScopeTree;
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn read_exact(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .expect("frames should arrive")
            .unwrap();
        buf
    }

    fn observer(capacity: usize) -> (DuplexStream, FrameWriter) {
        let (client, server) = tokio::io::duplex(capacity);
        (client, FrameWriter::new(server))
    }

    #[tokio::test]
    async fn test_frames_wait_for_observer_then_arrive_in_order() {
        let tree = ScopeTree::new();
        let queue = Arc::new(DeliveryQueue::new());
        let task = queue.spawn(tree.root().child());

        queue.enqueue(wire::stopped_frame("c1", 0));
        queue.enqueue(wire::data_frame("c1", b"abc"));
        queue.enqueue(wire::stopped_frame("c2", 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 3);

        let (mut client, writer) = observer(1024);
        queue
            .register_observer(SessionId::from("s1"), writer, tree.root().child())
            .await
            .unwrap();

        let mut expected = b"ok\0".to_vec();
        expected.extend_from_slice(b"stopped:c1:0\0data:c1\0\0\0\0\x03abcstopped:c2:1\0");
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);
        assert!(queue.is_empty());

        tree.root().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replacing_observer_keeps_queued_frames() {
        let tree = ScopeTree::new();
        let queue = Arc::new(DeliveryQueue::new());

        let (mut first, first_writer) = observer(1024);
        let first_scope = tree.root().child();
        queue
            .register_observer(SessionId::from("a"), first_writer, first_scope.clone())
            .await
            .unwrap();
        queue.enqueue_all([wire::stopped_frame("x", 0), wire::stopped_frame("y", 0)]);

        let (mut second, second_writer) = observer(1024);
        queue
            .register_observer(SessionId::from("b"), second_writer, tree.root().child())
            .await
            .unwrap();
        assert!(first_scope.is_cancelled());
        assert_eq!(read_exact(&mut first, 3).await, b"ok\0");

        let task = queue.spawn(tree.root().child());
        let expected = b"ok\0stopped:x:0\0stopped:y:0\0";
        assert_eq!(read_exact(&mut second, expected.len()).await, expected);
        assert_eq!(queue.observer_session().await, Some(SessionId::from("b")));

        tree.root().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_observer_is_dropped_without_losing_frame() {
        let tree = ScopeTree::new();
        let queue = Arc::new(DeliveryQueue::with_write_timeout(Duration::from_millis(50)));
        let task = queue.spawn(tree.root().child());

        // Room for the acknowledgement only; nobody reads the rest.
        let (_stalled, writer) = observer(3);
        let stalled_scope = tree.root().child();
        queue
            .register_observer(SessionId::from("slow"), writer, stalled_scope.clone())
            .await
            .unwrap();
        queue.enqueue(wire::stopped_frame("z", 9));

        tokio::time::timeout(Duration::from_secs(2), stalled_scope.cancelled())
            .await
            .unwrap();
        assert_eq!(queue.observer_session().await, None);
        assert_eq!(queue.len(), 1);

        let (mut client, writer) = observer(1024);
        queue
            .register_observer(SessionId::from("fast"), writer, tree.root().child())
            .await
            .unwrap();
        let expected = b"ok\0stopped:z:9\0";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        tree.root().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_only_matches_current_session() {
        let tree = ScopeTree::new();
        let queue = DeliveryQueue::new();
        let (_client, writer) = observer(64);
        queue
            .register_observer(SessionId::from("a"), writer, tree.root().child())
            .await
            .unwrap();
        assert!(!queue.unregister_observer(&SessionId::from("b")).await);
        assert!(queue.unregister_observer(&SessionId::from("a")).await);
        assert_eq!(queue.observer_session().await, None);
    }
}
