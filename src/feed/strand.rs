//! The Rust realization of a "strand": a single-writer execution context
//! serializing callbacks that share a logical owner (§5, §5.1).
//!
//! Each feed owns one `Strand<S>`, which pins a single `tokio` task as the
//! sole mutator of `S`. Callers submit a closure and `.await` its result;
//! the task drains submissions one at a time off an `async-channel`, so
//! two concurrent `pub`/`sub`/`unsub` calls on the same feed never
//! interleave (§5 "Ordering").

use tokio::sync::oneshot;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub struct Strand<S> {
    tx: async_channel::Sender<Job<S>>,
    task: tokio::task::JoinHandle<()>,
}

impl<S: Send + 'static> Strand<S> {
    pub fn new(state: S) -> Self {
        let (tx, rx) = async_channel::unbounded::<Job<S>>();
        let task = tokio::spawn(async move {
            let mut state = state;
            while let Ok(job) = rx.recv().await {
                job(&mut state);
            }
        });
        Self { tx, task }
    }

    /// Posts `f` to the strand and awaits its result. Because the task
    /// processes one job at a time, a `sub` awaited before a `pub` is
    /// guaranteed to observe the new subscriber, and an `unsub` awaited
    /// before a `pub` guarantees no further delivery to it (§5 (c), (d)).
    pub async fn run<R: Send + 'static>(&self, f: impl FnOnce(&mut S) -> R + Send + 'static) -> R {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move |state| {
                let _ = reply_tx.send(f(state));
            }))
            .await
            .expect("strand task should outlive its handles");
        reply_rx.await.expect("strand task panicked or was dropped")
    }

    /// Stops accepting new work; in-flight jobs still drain (§5
    /// "Cancellation": "feeds drain, no new pub accepted").
    pub fn close(&self) {
        self.tx.close();
    }
}

impl<S> Drop for Strand<S> {
    fn drop(&mut self) {
        self.tx.close();
        self.task.abort();
    }
}
