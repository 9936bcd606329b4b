//! Runs text extraction over a store, one record at a time.
//!
//! A run walks the store in order, picking the first pending record each
//! time, so records added mid-run are picked up and removed ones are simply
//! never seen again. Cancellation is checked between records only. A call
//! that has started always finishes and has its result recorded.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use indicatif::ProgressBar;
use leaky_bucket::RateLimiter;
use tokio::{
    sync::Semaphore,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    extract::{Extraction, TextExtractionClient},
    images::SourceImage,
    prelude::*,
    rate_limit::RateLimit,
    store::{RecordId, RecordUpdate, SharedStore},
};

/// Default pause between the end of one OCR call and the start of the next.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Progress reported when a record is picked.
const PROGRESS_STARTED: u8 = 10;
/// Progress reported once the upload is encoded.
const PROGRESS_ENCODED: u8 = 25;

/// Spaces out OCR calls. Allows a single call at a time, waits at least
/// `delay` after the previous call finished, and optionally also respects a
/// rate limit.
pub struct Pacer {
    single_flight: Semaphore,
    delay: Duration,
    rate_limiter: Option<RateLimiter>,
    last_finished: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(delay: Duration, rate_limit: Option<&RateLimit>) -> Self {
        Self {
            single_flight: Semaphore::new(1),
            delay,
            rate_limiter: rate_limit.map(|rl| rl.to_rate_limiter()),
            last_finished: Mutex::new(None),
        }
    }

    /// Wait until the next call may start.
    pub async fn ready(&self) {
        let last_finished = *self.last_finished.lock().expect("lock poisoned");
        if let Some(last_finished) = last_finished {
            sleep_until(last_finished + self.delay).await;
        }
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
    }

    /// Run `call` while holding the single-flight permit.
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .single_flight
            .acquire()
            .await
            .context("Could not acquire OCR permit")?;
        let result = call.await;
        *self.last_finished.lock().expect("lock poisoned") = Some(Instant::now());
        Ok(result)
    }
}

/// Counts for a single run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// How a call to [`BatchRunner::run`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The store was empty, so nothing ran.
    Empty,
    /// Another run was active, so nothing ran.
    AlreadyRunning,
    /// No pending records were left.
    Finished(BatchSummary),
    /// Stopped early by the cancellation token.
    Cancelled(BatchSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> BatchSummary {
        match self {
            RunOutcome::Finished(summary) | RunOutcome::Cancelled(summary) => *summary,
            RunOutcome::Empty | RunOutcome::AlreadyRunning => BatchSummary::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives a [`TextExtractionClient`] over the pending records of a store.
pub struct BatchRunner {
    store: SharedStore,
    client: Arc<TextExtractionClient>,
    pacer: Pacer,
    running: AtomicBool,
    progress: Option<ProgressBar>,
}

impl BatchRunner {
    pub fn new(store: SharedStore, client: Arc<TextExtractionClient>, pacer: Pacer) -> Self {
        Self {
            store,
            client,
            pacer,
            running: AtomicBool::new(false),
            progress: None,
        }
    }

    /// Advance `progress` once per finished record.
    pub fn with_progress_bar(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Extract text from every pending record, in store order.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        if self.store.lock().is_empty() {
            return RunOutcome::Empty;
        }
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            debug!("Batch already running");
            return RunOutcome::AlreadyRunning;
        };
        self.run_pending(cancel).await
    }

    /// Reset failed records to pending and run them again.
    #[instrument(level = "debug", skip_all)]
    pub async fn retry_failed(&self, cancel: &CancellationToken) -> RunOutcome {
        if self.store.lock().is_empty() {
            return RunOutcome::Empty;
        }
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            debug!("Batch already running");
            return RunOutcome::AlreadyRunning;
        };
        let reset = self.store.lock().reset_failed();
        info!(reset, "Retrying failed records");
        if let Some(progress) = &self.progress {
            progress.set_position(progress.position().saturating_sub(reset as u64));
        }
        self.run_pending(cancel).await
    }

    async fn run_pending(&self, cancel: &CancellationToken) -> RunOutcome {
        let mut summary = BatchSummary::default();
        loop {
            // Don't wait out the delay when there is nothing left to do.
            if self.store.lock().next_pending().is_none() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = self.pacer.ready() => {}
            }
            if cancel.is_cancelled() {
                info!(?summary, "Batch cancelled");
                return RunOutcome::Cancelled(summary);
            }
            let Some((id, source)) = self.claim_next() else {
                break;
            };

            summary.attempted += 1;
            if self.process(id, source).await {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }
        debug!(?summary, "Batch finished");
        RunOutcome::Finished(summary)
    }

    /// Mark the first pending record as in flight and return it.
    fn claim_next(&self) -> Option<(RecordId, SourceImage)> {
        let mut store = self.store.lock();
        let record = store.next_pending()?;
        let (id, source) = (record.id(), record.source().clone());
        store.update(id, RecordUpdate::Start);
        store.update(id, RecordUpdate::Progress(PROGRESS_STARTED));
        Some((id, source))
    }

    /// Extract text from one record and store the result. Returns `true` on
    /// success.
    #[instrument(level = "debug", skip_all, fields(id = %id, name = %source.name))]
    async fn process(&self, id: RecordId, source: SourceImage) -> bool {
        if let Some(progress) = &self.progress {
            progress.set_message(source.name.clone());
        }
        let call = async {
            match self.client.prepare(&source).await {
                Ok(request) => {
                    self.store
                        .update(id, RecordUpdate::Progress(PROGRESS_ENCODED));
                    self.client.send(&request).await
                }
                Err(err) => Extraction::Failed(err.to_string()),
            }
        };
        let extraction = self
            .pacer
            .run(call)
            .await
            .unwrap_or_else(|err| Extraction::Failed(format!("{err:#}")));

        match extraction {
            Extraction::Text(text) => {
                debug!(chars = text.chars().count(), "Extracted text");
                self.store.update(id, RecordUpdate::Done(text));
                true
            }
            Extraction::Failed(error) => {
                warn!(name = %source.name, "OCR failed: {error}");
                self.store.update(id, RecordUpdate::Failed(error));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::Notify;

    use super::*;
    use crate::{
        errors::ExtractionError,
        extract::{OcrEngine, OcrRequest, OcrResponse},
        store::{
            RecordStatus, RecordStore,
            tests::{CountingPreviews, assert_consistent, images},
        },
    };

    type StoreHook = Box<dyn FnOnce(&mut RecordStore) + Send>;

    /// A fake OCR engine. It fails for selected file names, and records
    /// when each call started and finished.
    #[derive(Default)]
    struct FakeEngine {
        store: Mutex<Option<SharedStore>>,
        on_first_call: Mutex<Option<StoreHook>>,
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<(String, Instant, Instant)>>,
        cancel_after: Mutex<Option<(String, CancellationToken)>>,
        gate: Option<Arc<Notify>>,
        latency: Duration,
    }

    #[async_trait]
    impl OcrEngine for FakeEngine {
        async fn recognize(
            &self,
            request: &OcrRequest,
        ) -> Result<OcrResponse, ExtractionError> {
            let started = Instant::now();
            let name = request.filename.clone().unwrap_or_default();
            if let Some(store) = &*self.store.lock().unwrap() {
                let mut store = store.lock();
                assert_eq!(store.counts().in_flight, 1);
                assert_consistent(&store);
                if let Some(hook) = self.on_first_call.lock().unwrap().take() {
                    hook(&mut store);
                }
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.latency).await;
            if let Some((trigger, cancel)) = &*self.cancel_after.lock().unwrap() {
                if *trigger == name {
                    cancel.cancel();
                }
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.clone(), started, Instant::now()));
            if self.failing.lock().unwrap().contains(&name) {
                Err(ExtractionError::Status {
                    status: 500,
                    body: "boom".to_owned(),
                })
            } else {
                Ok(OcrResponse {
                    success: true,
                    text: Some(format!("text of {name}")),
                    error: None,
                })
            }
        }
    }

    impl FakeEngine {
        fn call_names(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }
    }

    fn setup(
        count: usize,
        engine: FakeEngine,
        delay: Duration,
    ) -> (SharedStore, Arc<FakeEngine>, BatchRunner) {
        let mut store = RecordStore::new(Box::new(CountingPreviews::default()));
        if count > 0 {
            store.add(images(count)).unwrap();
        }
        let store = SharedStore::new(store);
        *engine.store.lock().unwrap() = Some(store.clone());
        let engine = Arc::new(engine);
        let client = Arc::new(TextExtractionClient::new(engine.clone(), 100, None));
        let runner = BatchRunner::new(store.clone(), client, Pacer::new(delay, None));
        (store, engine, runner)
    }

    fn statuses(store: &SharedStore) -> Vec<RecordStatus> {
        store.lock().records().iter().map(|r| r.status()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_record_in_order() {
        let (store, engine, runner) = setup(3, FakeEngine::default(), DEFAULT_DELAY);
        let outcome = runner.run(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            RunOutcome::Finished(BatchSummary {
                attempted: 3,
                succeeded: 3,
                failed: 0,
            })
        );
        assert_eq!(engine.call_names(), ["img0.png", "img1.png", "img2.png"]);
        let store = store.lock();
        for record in store.records() {
            assert_eq!(record.status(), RecordStatus::Done);
            assert_eq!(record.progress(), 100);
            assert_eq!(
                record.extracted_text(),
                Some(format!("text of {}", record.source().name).as_str())
            );
        }
    }

    #[tokio::test]
    async fn test_empty_store_is_noop() {
        let (_store, engine, runner) = setup(0, FakeEngine::default(), Duration::ZERO);
        assert_eq!(runner.run(&CancellationToken::new()).await, RunOutcome::Empty);
        assert!(engine.call_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort_the_batch() {
        let engine = FakeEngine::default();
        engine.failing.lock().unwrap().insert("img0.png".to_owned());
        let (store, _engine, runner) = setup(3, engine, DEFAULT_DELAY);
        let outcome = runner.run(&CancellationToken::new()).await;
        assert_eq!(outcome.summary().failed, 1);
        assert_eq!(outcome.summary().succeeded, 2);
        assert_eq!(
            statuses(&store),
            [RecordStatus::Failed, RecordStatus::Done, RecordStatus::Done]
        );
        let store = store.lock();
        assert_eq!(
            store.records()[0].error(),
            Some("OCR service returned HTTP 500: boom")
        );
        assert_consistent(&store);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_records() {
        let cancel = CancellationToken::new();
        let engine = FakeEngine::default();
        *engine.cancel_after.lock().unwrap() = Some(("img1.png".to_owned(), cancel.clone()));
        let (store, engine, runner) = setup(4, engine, DEFAULT_DELAY);

        let outcome = runner.run(&cancel).await;
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.summary().attempted, 2);
        assert_eq!(engine.call_names(), ["img0.png", "img1.png"]);
        // The call in flight when we cancelled still has its result recorded.
        assert_eq!(
            statuses(&store),
            [
                RecordStatus::Done,
                RecordStatus::Done,
                RecordStatus::Pending,
                RecordStatus::Pending,
            ]
        );
        assert!(!runner.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let (store, engine, runner) = setup(2, FakeEngine::default(), DEFAULT_DELAY);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner.run(&cancel).await;
        assert_eq!(outcome, RunOutcome::Cancelled(BatchSummary::default()));
        assert!(engine.call_names().is_empty());
        assert_eq!(statuses(&store), [RecordStatus::Pending, RecordStatus::Pending]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed() {
        let engine = FakeEngine::default();
        engine
            .failing
            .lock()
            .unwrap()
            .extend(["img1.png".to_owned(), "img2.png".to_owned()]);
        let (store, engine, runner) = setup(3, engine, DEFAULT_DELAY);
        let cancel = CancellationToken::new();

        runner.run(&cancel).await;
        assert_eq!(
            statuses(&store),
            [RecordStatus::Done, RecordStatus::Failed, RecordStatus::Failed]
        );

        engine.failing.lock().unwrap().clear();
        let outcome = runner.retry_failed(&cancel).await;
        assert_eq!(
            outcome,
            RunOutcome::Finished(BatchSummary {
                attempted: 2,
                succeeded: 2,
                failed: 0,
            })
        );
        assert_eq!(statuses(&store), [RecordStatus::Done; 3]);
        assert_eq!(
            engine.call_names(),
            ["img0.png", "img1.png", "img2.png", "img1.png", "img2.png"]
        );
        assert_consistent(&store.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_paced() {
        let delay = Duration::from_millis(500);
        let engine = FakeEngine {
            latency: Duration::from_millis(200),
            ..FakeEngine::default()
        };
        let (_store, engine, runner) = setup(4, engine, delay);
        runner.run(&CancellationToken::new()).await;

        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            let (_, _, previous_end) = &pair[0];
            let (_, next_start, _) = &pair[1];
            assert!(*next_start >= *previous_end + delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_last_record() {
        let delay = Duration::from_secs(5);
        let engine = FakeEngine::default();
        engine.failing.lock().unwrap().insert("img1.png".to_owned());
        let (_store, engine, runner) = setup(2, engine, delay);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        runner.run(&cancel).await;
        assert_eq!(started.elapsed(), delay);

        engine.failing.lock().unwrap().clear();
        let started = Instant::now();
        let outcome = runner.retry_failed(&cancel).await;
        assert_eq!(outcome.summary().succeeded, 1);
        assert!(started.elapsed() <= delay);

        // Nothing pending, so nothing to wait for.
        let started = Instant::now();
        let outcome = runner.run(&cancel).await;
        assert_eq!(outcome, RunOutcome::Finished(BatchSummary::default()));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_noop_while_running() {
        let gate = Arc::new(Notify::new());
        let engine = FakeEngine {
            gate: Some(gate.clone()),
            ..FakeEngine::default()
        };
        let (_store, engine, runner) = setup(1, engine, Duration::ZERO);
        let runner = Arc::new(runner);
        let cancel = CancellationToken::new();

        let first = tokio::spawn({
            let runner = runner.clone();
            let cancel = cancel.clone();
            async move { runner.run(&cancel).await }
        });
        while !runner.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(runner.run(&cancel).await, RunOutcome::AlreadyRunning);
        assert_eq!(runner.retry_failed(&cancel).await, RunOutcome::AlreadyRunning);

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert_eq!(outcome.summary().succeeded, 1);
        assert_eq!(engine.call_names(), ["img0.png"]);
        assert!(!runner.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_added_and_removed_mid_run() {
        let engine = FakeEngine::default();
        *engine.on_first_call.lock().unwrap() = Some(Box::new(|store: &mut RecordStore| {
            let second = store.records()[1].id();
            store.remove(second);
            let mut late = images(1);
            late[0].name = "late.png".to_owned();
            store.add(late).unwrap();
        }));
        let (store, engine, runner) = setup(2, engine, Duration::ZERO);

        let outcome = runner.run(&CancellationToken::new()).await;
        assert_eq!(outcome.summary().attempted, 2);
        assert_eq!(engine.call_names(), ["img0.png", "late.png"]);
        assert_eq!(statuses(&store), [RecordStatus::Done, RecordStatus::Done]);
    }
}
