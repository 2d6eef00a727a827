//! Background batch execution.
//!
//! One interactive context owns an [`Engine`]; a rayon pool supplies the
//! worker contexts. Each submitted page builds its processing chain,
//! executes it start to finish on one worker, and sends a [`Delivery`]
//! back over a channel. Deliveries arrive in completion order, not
//! submission order — consumers match them to pages by identity.
//!
//! Worker panics are contained at the job boundary and surfaced as error
//! results: one poisoned page must never take down the batch or the
//! process, and the interactive context stays alive to save work.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use recto_pipeline::{
    CancellationToken, ChainOutcome, PageId, PageInfo, PagePayload, ResultCommand, StageError,
    StageKind, Stages, Validity,
};

use crate::load;

/// One page's outcome, delivered back to the interactive context.
#[derive(Debug)]
pub struct Delivery {
    /// The page the outcome belongs to.
    pub page_id: PageId,
    /// What the chain produced.
    pub outcome: ChainOutcome,
}

/// Engine construction errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Dispatches per-page chains onto background workers.
pub struct Engine {
    stages: Arc<Stages>,
    pool: rayon::ThreadPool,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    token: Mutex<CancellationToken>,
}

impl Engine {
    /// An engine with one worker per logical CPU.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Pool`] if the worker pool cannot be built.
    pub fn new(stages: Arc<Stages>) -> Result<Self, EngineError> {
        Self::with_workers(stages, num_cpus::get())
    }

    /// An engine with an explicit worker count.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Pool`] if the worker pool cannot be built.
    pub fn with_workers(stages: Arc<Stages>, workers: usize) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("recto-worker-{i}"))
            .build()?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            stages,
            pool,
            sender,
            receiver,
            token: Mutex::new(CancellationToken::new()),
        })
    }

    /// The pipeline this engine executes.
    #[must_use]
    pub const fn stages(&self) -> &Arc<Stages> {
        &self.stages
    }

    /// Receiving end for deliveries. Arrival order is unspecified.
    #[must_use]
    pub const fn results(&self) -> &Receiver<Delivery> {
        &self.receiver
    }

    /// Cancel every in-flight chain at its next stage boundary.
    ///
    /// Pages submitted after this call run under a fresh token.
    pub fn cancel_all(&self) {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Queue one page for background processing through `target`.
    pub fn submit(&self, info: PageInfo, target: StageKind, batch: bool, debug: bool) {
        let stages = Arc::clone(&self.stages);
        let sender = self.sender.clone();
        let token = self.current_token();
        debug!(page = %info.id().image_id().path().display(), %target, "submitting page");
        self.pool.spawn(move || {
            let page_id = info.id().clone();
            let outcome = run_chain(&stages, &info, target, batch, debug, &token);
            if sender
                .send(Delivery {
                    page_id: page_id.clone(),
                    outcome,
                })
                .is_err()
            {
                debug!(page = ?page_id, "delivery channel closed; result dropped");
            }
        });
    }

    /// Pages whose cached results are not `Valid` through `target`.
    ///
    /// Runs on the calling context — validity chains never touch pixels,
    /// so this is cheap enough for page-list redraws.
    #[must_use]
    pub fn find_stale(&self, infos: &[PageInfo], target: StageKind) -> Vec<PageId> {
        let chain = self.stages.validity_chain(target);
        infos
            .iter()
            .filter(|info| chain.check_validity(info) != Validity::Valid)
            .map(|info| info.id().clone())
            .collect()
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Load the page's source, run its chain, and contain any panic.
fn run_chain(
    stages: &Stages,
    info: &PageInfo,
    target: StageKind,
    batch: bool,
    debug: bool,
    token: &CancellationToken,
) -> ChainOutcome {
    if token.is_cancelled() {
        return ChainOutcome::Cancelled;
    }
    contain_panics(info.id(), batch, AssertUnwindSafe(|| {
        let image = load::load_source(info.id().image_id())?;
        let chain = stages.processing_chain(info.id(), target, batch, debug);
        Ok(chain.execute(token, PagePayload::new(info.clone(), image)))
    }))
}

/// Run `job`, converting a `StageError` or a panic into a failure
/// delivery attributed to the head of the pipeline.
fn contain_panics<F>(page_id: &PageId, batch: bool, job: F) -> ChainOutcome
where
    F: FnOnce() -> Result<ChainOutcome, StageError> + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(job) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(stage_error)) => ChainOutcome::Finished(ResultCommand::failure(
            StageKind::Orientation,
            batch,
            page_id.clone(),
            stage_error,
        )),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(page = ?page_id, panic = message, "worker panicked; containing");
            ChainOutcome::Finished(ResultCommand::failure(
                StageKind::Orientation,
                batch,
                page_id.clone(),
                StageError::Aborted(message.to_string()),
            ))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload.downcast_ref::<&str>().copied().unwrap_or_else(|| {
        payload
            .downcast_ref::<String>()
            .map_or("unknown panic", String::as_str)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use recto_pipeline::{DefaultBundles, ImageId, SubPage};
    use std::collections::HashSet;
    use std::time::Duration;

    fn write_block_page(dir: &std::path::Path, name: &str) -> PageId {
        let path = dir.join(name);
        let img = RgbaImage::from_fn(100, 100, |x, y| {
            if (20..60).contains(&x) && (20..60).contains(&y) {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        img.save(&path).unwrap();
        PageId::new(ImageId::new(path, 0), SubPage::Single)
    }

    fn engine() -> Engine {
        Engine::with_workers(Arc::new(Stages::new(&DefaultBundles::default())), 2).unwrap()
    }

    #[test]
    fn deliveries_are_matched_by_page_identity() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let mut submitted = HashSet::new();
        for name in ["a.png", "b.png", "c.png"] {
            let page = write_block_page(dir.path(), name);
            let info = load::describe_page(page.clone()).unwrap();
            submitted.insert(page);
            engine.submit(info, StageKind::Output, true, false);
        }

        // Whatever order workers finish in, every page reports exactly
        // once.
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let delivery = engine
                .results()
                .recv_timeout(Duration::from_secs(30))
                .unwrap();
            let command = delivery.outcome.command().unwrap();
            assert!(!command.is_failure());
            assert_eq!(command.page_id(), &delivery.page_id);
            assert!(seen.insert(delivery.page_id));
        }
        assert_eq!(seen, submitted);
    }

    #[test]
    fn missing_source_surfaces_as_failure_delivery() {
        let engine = engine();
        let page = PageId::single(ImageId::new("/nonexistent/scan.png", 0));
        let info = PageInfo::new(page.clone(), recto_pipeline::Dimensions::new(10, 10), 0);
        engine.submit(info, StageKind::Output, true, false);

        let delivery = engine
            .results()
            .recv_timeout(Duration::from_secs(30))
            .unwrap();
        assert_eq!(delivery.page_id, page);
        assert!(delivery.outcome.command().unwrap().is_failure());
    }

    #[test]
    fn pre_cancelled_token_yields_cancelled_without_loading() {
        let stages = Stages::new(&DefaultBundles::default());
        let page = PageId::single(ImageId::new("/nonexistent/scan.png", 0));
        let info = PageInfo::new(page, recto_pipeline::Dimensions::new(10, 10), 0);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_chain(&stages, &info, StageKind::Output, true, false, &token);
        assert!(matches!(outcome, ChainOutcome::Cancelled));
    }

    #[test]
    fn panics_are_contained_as_aborted_failures() {
        let page = PageId::single(ImageId::new("scan.png", 0));
        let outcome = contain_panics(&page, true, || -> Result<ChainOutcome, StageError> {
            std::panic::panic_any("simulated out-of-memory".to_string())
        });
        let command = outcome.command().unwrap();
        assert!(command.is_failure());
        assert_eq!(command.page_id(), &page);
    }

    #[test]
    fn find_stale_reports_unprocessed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let processed = load::describe_page(write_block_page(dir.path(), "done.png")).unwrap();
        let fresh = load::describe_page(write_block_page(dir.path(), "todo.png")).unwrap();

        engine.submit(processed.clone(), StageKind::Output, true, false);
        engine
            .results()
            .recv_timeout(Duration::from_secs(30))
            .unwrap();

        let stale = engine.find_stale(
            &[processed.clone(), fresh.clone()],
            StageKind::Output,
        );
        assert_eq!(stale, vec![fresh.id().clone()]);
    }

    #[test]
    fn cancel_all_refreshes_the_token_for_later_submits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        engine.cancel_all();

        // Work submitted after cancellation runs normally.
        let info = load::describe_page(write_block_page(dir.path(), "late.png")).unwrap();
        engine.submit(info, StageKind::Output, true, false);
        let delivery = engine
            .results()
            .recv_timeout(Duration::from_secs(30))
            .unwrap();
        assert!(delivery.outcome.command().is_some());
    }
}
