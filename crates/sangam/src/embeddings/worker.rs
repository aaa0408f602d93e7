use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::EmbeddingModel;
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

enum Job {
    Embed {
        texts: Vec<String>,
        reply: oneshot::Sender<Result<Vec<Vec<f32>>>>,
    },
    Shutdown,
}

/// Async facade over a single long-lived worker thread that owns the
/// embedding model.
///
/// Requests travel over an mpsc queue; each carries its own oneshot reply
/// slot, so replies correlate to requests regardless of queue order. If a
/// caller is cancelled mid-flight, its reply slot is simply dropped and the
/// worker discards the result.
pub struct EmbeddingService {
    sender: mpsc::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dimension: usize,
}

impl EmbeddingService {
    /// Start the worker thread. The model moves into the thread and is
    /// loaded exactly once for the lifetime of the service.
    pub fn spawn(model: Box<dyn EmbeddingModel>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let dimension = model.dimension();
        let worker = std::thread::Builder::new()
            .name("embedding-worker".into())
            .spawn(move || worker_loop(model, receiver))
            .map_err(|e| Error::Embedding(format!("failed to start worker thread: {e}")))?;

        tracing::info!("embedding worker started (dimension {dimension})");
        Ok(Self {
            sender,
            worker: Mutex::new(Some(worker)),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a batch, retrying transient failures with a fixed backoff
    /// before surfacing the last error.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.request(texts.clone()).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Embedding("embedding failed".into())))
    }

    async fn request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job::Embed { texts, reply })
            .map_err(|_| Error::Embedding("embedding worker is not running".into()))?;
        response
            .await
            .map_err(|_| Error::Embedding("embedding worker dropped the request".into()))?
    }

    /// Send the termination sentinel and join the worker thread.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Job::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
            tracing::info!("embedding worker stopped");
        }
    }
}

fn worker_loop(model: Box<dyn EmbeddingModel>, receiver: mpsc::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Embed { texts, reply } => {
                let result = model.embed(&texts);
                // The caller may have been cancelled; a closed reply slot
                // just discards the result.
                let _ = reply.send(result);
            }
            Job::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubModel {
        dimension: usize,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl EmbeddingModel for StubModel {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::Embedding("transient failure".into()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dimension];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    fn service(fail_first: usize) -> (Arc<AtomicUsize>, EmbeddingService) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel {
            dimension: 4,
            calls: calls.clone(),
            fail_first,
        };
        (calls, EmbeddingService::spawn(Box::new(model)).unwrap())
    }

    #[tokio::test]
    async fn embeds_in_input_order() {
        let (_, service) = service(0);
        let vectors = service
            .embed(vec!["a".into(), "abc".into(), "ab".into()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[1][0], 3.0);
        assert_eq!(vectors[2][0], 2.0);
        service.shutdown();
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (calls, service) = service(2);
        let vectors = service.embed(vec!["hello".into()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        service.shutdown();
    }

    #[tokio::test]
    async fn surfaces_persistent_failures() {
        let (calls, service) = service(usize::MAX);
        let err = service.embed(vec!["hello".into()]).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        service.shutdown();
    }

    #[tokio::test]
    async fn embed_after_shutdown_fails() {
        let (_, service) = service(0);
        service.shutdown();
        assert!(service.embed(vec!["hello".into()]).await.is_err());
    }
}
