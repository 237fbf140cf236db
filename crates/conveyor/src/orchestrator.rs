//! The tick loop: one invocation makes bounded progress on one run
//! and returns, never blocking past its own budget. Everything durable it
//! touches goes through [`conveyor_state::RunStore`] and
//! [`conveyor_lock::LockStore`]; this module only sequences those calls and
//! classifies what the step runner handed back.

use std::cell::RefCell;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conveyor_config::{ConveyorConfig, SftpEnvConfig};
use conveyor_events::EventLog;
use conveyor_lock::LockStore;
use conveyor_retry::{RetryDecision, decide_retry};
use conveyor_state::RunStore;
use conveyor_storage::{HttpRangeFetcher, StorageBackend};
use conveyor_types::{RunStatus, StepName, StepState, TickResponse, TickStatus, TriggerType};
use conveyor_webhook::{Notifier, RunSummary};

use crate::reporter::Reporter;
use crate::sources::FeedSource;
use crate::steps::{StepContext, StepOutcome, run_step};

/// Every collaborator a tick needs, bundled once per invocation by the CLI.
/// `run_store` and `lock_store` share the same `state_root`.
pub struct TickDeps<'a> {
    pub run_store: &'a RunStore,
    pub lock_store: &'a LockStore,
    pub state_root: &'a Path,
    pub storage: &'a dyn StorageBackend,
    pub fetcher: &'a HttpRangeFetcher,
    pub feeds: &'a dyn FeedSource,
    pub notifier: &'a dyn Notifier,
    pub sftp: &'a SftpEnvConfig,
    pub config: &'a ConveyorConfig,
}

fn events_path(state_root: &Path, run_id: Uuid) -> std::path::PathBuf {
    conveyor_events::events_path(&conveyor_state::run_dir(state_root, run_id))
}

/// Create a brand-new run record at `current_step = import_ftp`. Returns the freshly allocated `run_id`.
pub fn start_new_run(run_store: &RunStore, trigger: TriggerType, now: DateTime<Utc>) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    let record = conveyor_types::RunRecord::new(run_id, trigger, now);
    run_store.create(&record)?;
    Ok(run_id)
}

/// Entry mode "resume without an explicit run id": the most
/// recently started run still in `Running` status, if any.
pub fn find_running_run(run_store: &RunStore) -> Result<Option<Uuid>> {
    let mut candidate: Option<conveyor_types::RunRecord> = None;
    for run_id in run_store.list_run_ids()? {
        let record = run_store.load(run_id)?;
        if record.status != RunStatus::Running {
            continue;
        }
        let better = match &candidate {
            None => true,
            Some(existing) => record.started_at > existing.started_at,
        };
        if better {
            candidate = Some(record);
        }
    }
    Ok(candidate.map(|r| r.run_id))
}

/// Build and stage `run_summary.json` ahead of dispatching the
/// `notification` step, for either the normal completion path or an
/// app-level failure/cancellation path. Both stage a summary, then dispatch
/// through [`run_step`] the same way, so the notification step's own
/// retry/failure semantics (spec §4.1: "notification is blocking") apply
/// uniformly regardless of how the run got here.
fn stage_run_summary(
    deps: &TickDeps,
    run_id: Uuid,
    status: RunStatus,
    current_step: Option<StepName>,
    warning_count: u32,
    error_message: Option<String>,
) -> Result<()> {
    let summary = RunSummary { run_id, status, current_step, warning_count, runtime_ms: None, error_message, finished_at: None };
    let bytes = serde_json::to_vec(&summary)?;
    deps.storage.write(&format!("state/{run_id}/run_summary.json"), &bytes)?;
    Ok(())
}

/// Dispatch the `notification` step directly, outside the tick loop's usual
/// per-step bookkeeping (no retry-delay scheduling, no WORKER_LIMIT
/// handling — a notifier failure here is recorded and surfaced, never
/// retried across invocations). Used by [`finalize_failed`] and
/// [`finalize_cancelled`] to still attempt the notification on an app-level
/// failure/cancellation path, per spec §4.1 steps 1–3.
fn dispatch_failure_notification(deps: &TickDeps, run_id: Uuid, now: DateTime<Utc>, reporter: &mut dyn Reporter) -> Result<()> {
    let mut events = EventLog::new();
    let outcome = {
        let ctx = StepContext {
            run_id,
            storage: deps.storage,
            fetcher: deps.fetcher,
            feeds: deps.feeds,
            notifier: deps.notifier,
            sftp: deps.sftp,
            config: deps.config,
            now,
            invocation_deadline: Instant::now() + Duration::from_millis(deps.config.orchestrator.budget_ms),
            events: RefCell::new(&mut events),
        };
        run_step(StepName::Notification, &ctx, None)
    };
    events.write_to_file(&events_path(deps.state_root, run_id))?;

    match outcome {
        StepOutcome::Completed => {
            reporter.info(&format!("step {} completed", StepName::Notification));
            deps.run_store.complete_step(run_id, StepName::Notification)?;
        }
        StepOutcome::Failed { reason } => {
            reporter.warn(&format!("notification did not go through: {reason}"));
            deps.run_store.fail_step(run_id, StepName::Notification, reason)?;
        }
        other => {
            reporter.warn(&format!("notification step returned an unexpected outcome: {other:?}"));
            deps.run_store.fail_step(run_id, StepName::Notification, format!("unexpected outcome: {other:?}"))?;
        }
    }
    Ok(())
}

/// Finalize a run that failed before reaching the `notification` step
/// through the normal 13-step walk. Still stages a summary and dispatches
/// `notification` through the same step runner the success path uses — an
/// operator who cannot be told a run failed is worse off than one told late
/// — but the run's terminal status (`Failed`, with the original failure
/// reason) never depends on that dispatch succeeding.
fn finalize_failed(deps: &TickDeps, run_id: Uuid, reason: String, now: DateTime<Utc>, reporter: &mut dyn Reporter) -> Result<()> {
    let events = EventLog::read_from_file(&events_path(deps.state_root, run_id))?;
    let warning_count = events.countable_warning_count(run_id);
    let current_step = deps.run_store.load(run_id)?.current_step;

    stage_run_summary(deps, run_id, RunStatus::Failed, current_step, warning_count, Some(reason.clone()))?;

    // If the step that just failed this same tick was itself `notification`,
    // it has already been dispatched and marked `Failed` — don't redispatch.
    if current_step != Some(StepName::Notification) {
        dispatch_failure_notification(deps, run_id, now, reporter)?;
    }

    deps.run_store.finalize(run_id, RunStatus::Failed, warning_count, Some(reason))?;
    deps.lock_store.release(run_id)?;
    Ok(())
}

/// Cancellation finalizes the run as `Failed` with `cancelled_by_user = true`
/// (the `Cancelled` status in [`RunStatus`] is reserved for entry modes this
/// cooperative in-pipeline path never reaches), marks whatever step was
/// current as `Failed { reason: "cancelled" }`, and still stages a summary
/// and dispatches `notification` through the normal step runner before
/// finalizing.
fn finalize_cancelled(
    deps: &TickDeps,
    run_id: Uuid,
    current_step: Option<StepName>,
    now: DateTime<Utc>,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    if let Some(step) = current_step {
        deps.run_store.fail_step(run_id, step, "cancelled")?;
    }
    deps.run_store.mark_cancelled_by_user(run_id)?;

    let events = EventLog::read_from_file(&events_path(deps.state_root, run_id))?;
    let warning_count = events.countable_warning_count(run_id);

    stage_run_summary(deps, run_id, RunStatus::Failed, current_step, warning_count, Some("cancelled_by_user".to_string()))?;
    dispatch_failure_notification(deps, run_id, now, reporter)?;

    deps.run_store.finalize(run_id, RunStatus::Failed, warning_count, Some("cancelled_by_user".to_string()))?;
    deps.lock_store.release(run_id)?;
    Ok(())
}

fn yielded(run_id: Uuid, step: Option<StepName>) -> TickResponse {
    TickResponse {
        status: TickStatus::Yielded,
        run_id,
        current_step: step,
        needs_resume: true,
        wait_seconds: Some(0),
        next_retry_at: None,
    }
}

/// Make bounded progress on one run. Acquires or renews the global
/// lock, then walks [`conveyor_types::CANONICAL_STEPS`] from
/// `current_step` onward, dispatching each to [`run_step`] and persisting
/// the outcome, until either the run finishes, a step yields mid-flight, a
/// retry delay isn't due yet, or the invocation's own time budget runs out.
pub fn tick(
    deps: &TickDeps,
    run_id: Uuid,
    invocation_id: Uuid,
    now: DateTime<Utc>,
    reporter: &mut dyn Reporter,
) -> Result<TickResponse> {
    let tick_start = Instant::now();
    let overall_budget = Duration::from_millis(deps.config.orchestrator.budget_ms);
    let lock_ttl = Duration::from_secs(deps.config.lock.ttl_seconds);

    if !deps.run_store.exists(run_id) {
        bail!("run {run_id} has no persisted record; create it before ticking");
    }

    {
        let record = deps.run_store.load(run_id)?;
        if record.status != RunStatus::Running {
            return Ok(TickResponse {
                status: TickStatus::AlreadyFinished,
                run_id,
                current_step: record.current_step,
                needs_resume: false,
                wait_seconds: None,
                next_retry_at: None,
            });
        }
    }

    loop {
        if Instant::now().duration_since(tick_start) >= overall_budget {
            let record = deps.run_store.load(run_id)?;
            return Ok(yielded(run_id, record.current_step));
        }

        if !deps.lock_store.acquire_or_renew(run_id, invocation_id, lock_ttl, now)? {
            let record = deps.run_store.load(run_id)?;
            return Ok(TickResponse {
                status: TickStatus::YieldedLocked,
                run_id,
                current_step: record.current_step,
                needs_resume: true,
                wait_seconds: Some(5),
                next_retry_at: None,
            });
        }

        let record = deps.run_store.load(run_id)?;

        if record.cancel_requested {
            finalize_cancelled(deps, run_id, record.current_step, now, reporter)?;
            return Ok(TickResponse {
                status: TickStatus::FailedDefinitive,
                run_id,
                current_step: record.current_step,
                needs_resume: false,
                wait_seconds: None,
                next_retry_at: None,
            });
        }

        let Some(step) = record.current_step else {
            break;
        };

        match record.steps.get(&step) {
            Some(StepState::Completed) => {
                // Already done (idempotent replay); current_step should have
                // advanced past this on the write that completed it, but
                // guard against a stale cursor rather than reprocess.
                deps.run_store.complete_step(run_id, step)?;
                continue;
            }
            Some(StepState::RetryDelay { retry, .. }) => {
                if !conveyor_retry::is_due(retry, now) {
                    let wait = (retry.next_retry_at - now).num_seconds().max(0) as u64;
                    return Ok(TickResponse {
                        status: TickStatus::RetryDelay,
                        run_id,
                        current_step: Some(step),
                        needs_resume: true,
                        wait_seconds: Some(wait),
                        next_retry_at: Some(retry.next_retry_at),
                    });
                }
            }
            _ => {}
        }

        let prior_attempt = match record.steps.get(&step) {
            Some(StepState::RetryDelay { retry, .. }) => retry.retry_attempt,
            _ => 0,
        };
        let prior_inner = match record.steps.get(&step) {
            Some(StepState::InProgress { inner }) => inner.clone(),
            Some(StepState::RetryDelay { inner, .. }) => inner.clone(),
            _ => None,
        };

        if step == StepName::Notification {
            let events = EventLog::read_from_file(&events_path(deps.state_root, run_id))?;
            let warning_count = events.countable_warning_count(run_id);
            let status = if warning_count > 0 { RunStatus::SuccessWithWarning } else { RunStatus::Success };
            stage_run_summary(deps, run_id, status, Some(StepName::Notification), warning_count, None)?;
        }

        deps.run_store.set_step_in_progress(run_id, step)?;

        let step_budget_ms = if step == StepName::ParseMerge {
            deps.config.orchestrator.parse_merge_budget_ms
        } else {
            deps.config.orchestrator.budget_ms
        };
        let invocation_deadline = Instant::now() + Duration::from_millis(step_budget_ms);

        let mut events = EventLog::new();
        let outcome = {
            let ctx = StepContext {
                run_id,
                storage: deps.storage,
                fetcher: deps.fetcher,
                feeds: deps.feeds,
                notifier: deps.notifier,
                sftp: deps.sftp,
                config: deps.config,
                now,
                invocation_deadline,
                events: RefCell::new(&mut events),
            };
            run_step(step, &ctx, prior_inner)
        };
        events.write_to_file(&events_path(deps.state_root, run_id))?;

        match outcome {
            StepOutcome::Completed => {
                reporter.info(&format!("step {step} completed"));
                deps.run_store.complete_step(run_id, step)?;
            }
            StepOutcome::CompletedWithMetrics(metrics) => {
                reporter.info(&format!("step {step} completed"));
                deps.run_store.complete_step(run_id, step)?;
                deps.run_store.update_metrics(run_id, metrics)?;
            }
            StepOutcome::CompletedWithFileManifest(manifest) => {
                reporter.info(&format!("step {step} completed"));
                deps.run_store.complete_step(run_id, step)?;
                deps.run_store.update_file_manifest(run_id, manifest)?;
            }
            StepOutcome::CompletedWithLocationWarnings(warnings) => {
                reporter.info(&format!("step {step} completed"));
                deps.run_store.complete_step(run_id, step)?;
                deps.run_store.update_location_warnings(run_id, warnings)?;
            }
            StepOutcome::InProgress { inner } => {
                if let Some(inner) = inner {
                    deps.run_store.merge_parse_merge_inner(run_id, inner)?;
                }
                return Ok(yielded(run_id, Some(step)));
            }
            StepOutcome::WorkerLimit { http_status, message } => {
                match decide_retry(prior_attempt, now, deps.config.retry.jitter_fraction) {
                    RetryDecision::ScheduleRetry(retry) => {
                        reporter.warn(&format!("step {step} hit WORKER_LIMIT (http {http_status}), retry {} scheduled", retry.retry_attempt));
                        let wait = (retry.next_retry_at - now).num_seconds().max(0) as u64;
                        let next_retry_at = retry.next_retry_at;
                        deps.run_store.schedule_retry(run_id, step, retry)?;
                        return Ok(TickResponse {
                            status: TickStatus::RetryDelay,
                            run_id,
                            current_step: Some(step),
                            needs_resume: true,
                            wait_seconds: Some(wait),
                            next_retry_at: Some(next_retry_at),
                        });
                    }
                    RetryDecision::Exhausted { attempts_made } => {
                        let reason = format!(
                            "step {step} exhausted {attempts_made} WORKER_LIMIT retries (last http {http_status}: {message})"
                        );
                        deps.run_store.fail_step(run_id, step, reason.clone())?;
                        finalize_failed(deps, run_id, reason, now, reporter)?;
                        return Ok(TickResponse {
                            status: TickStatus::FailedDefinitive,
                            run_id,
                            current_step: Some(step),
                            needs_resume: false,
                            wait_seconds: None,
                            next_retry_at: None,
                        });
                    }
                }
            }
            StepOutcome::Failed { reason } => {
                reporter.error(&format!("step {step} failed: {reason}"));
                deps.run_store.fail_step(run_id, step, reason.clone())?;
                finalize_failed(deps, run_id, reason, now, reporter)?;
                return Ok(TickResponse {
                    status: TickStatus::FailedDefinitive,
                    run_id,
                    current_step: Some(step),
                    needs_resume: false,
                    wait_seconds: None,
                    next_retry_at: None,
                });
            }
        }
    }

    // current_step is now None: every canonical step completed.
    let events = EventLog::read_from_file(&events_path(deps.state_root, run_id))?;
    let warning_count = events.countable_warning_count(run_id);
    let status = if warning_count > 0 { RunStatus::SuccessWithWarning } else { RunStatus::Success };
    deps.run_store.finalize(run_id, status, warning_count, None)?;
    deps.lock_store.release(run_id)?;

    reporter.info(&format!("run {run_id} finished: {status:?} ({warning_count} warning(s))"));

    Ok(TickResponse {
        status: TickStatus::Completed,
        run_id,
        current_step: None,
        needs_resume: false,
        wait_seconds: None,
        next_retry_at: None,
    })
}

/// The resume/tick scheduler: drives [`tick`] until the run reaches a
/// terminal status, sleeping between invocations when a tick reports a
/// delay. A fresh `invocation_id` is minted every call, matching the
/// contract that ownership is per-invocation, not per-process.
pub fn run_to_completion(deps: &TickDeps, run_id: Uuid, reporter: &mut dyn Reporter) -> Result<TickResponse> {
    loop {
        let invocation_id = Uuid::new_v4();
        let now = Utc::now();
        let response = tick(deps, run_id, invocation_id, now, reporter)?;

        match response.status {
            TickStatus::Completed | TickStatus::FailedDefinitive | TickStatus::AlreadyFinished => {
                return Ok(response);
            }
            TickStatus::Yielded => continue,
            TickStatus::RetryDelay | TickStatus::YieldedLocked => {
                let wait = response.wait_seconds.unwrap_or(5).max(1);
                reporter.info(&format!("waiting {wait}s before next tick ({:?})", response.status));
                std::thread::sleep(Duration::from_secs(wait));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::ConveyorConfig;
    use conveyor_storage::FileStorage;
    use conveyor_webhook::NullNotifier;
    use tempfile::tempdir;

    struct FixedFeedSource {
        dir: std::path::PathBuf,
    }

    impl FeedSource for FixedFeedSource {
        fn fetch_stock_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            std::fs::read(self.dir.join("stock.csv"))
                .map_err(|e| crate::sources::FeedError::Io { path: "stock.csv".into(), source: e })
        }
        fn fetch_price_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            std::fs::read(self.dir.join("price.csv"))
                .map_err(|e| crate::sources::FeedError::Io { path: "price.csv".into(), source: e })
        }
        fn fetch_location_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            Err(crate::sources::FeedError::NotConfigured("location".into()))
        }
        fn material_url(&self) -> Result<String, crate::sources::FeedError> {
            Err(crate::sources::FeedError::NotConfigured("material_url".into()))
        }
    }

    #[test]
    fn start_new_run_begins_at_import_ftp() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        let record = store.load(run_id).unwrap();
        assert_eq!(record.current_step, Some(StepName::ImportFtp));
    }

    #[test]
    fn find_running_run_ignores_finished_runs() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        store.finalize(run_id, RunStatus::Success, 0, None).unwrap();
        assert!(find_running_run(&store).unwrap().is_none());

        let running = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        assert_eq!(find_running_run(&store).unwrap(), Some(running));
    }

    #[test]
    fn tick_on_unknown_run_is_an_error() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let lock = LockStore::new(td.path());
        let storage = FileStorage::new(td.path().join("objects"));
        let fetcher = HttpRangeFetcher::new();
        let feeds = FixedFeedSource { dir: td.path().to_path_buf() };
        let notifier = NullNotifier;
        let config = ConveyorConfig::default();
        let deps = TickDeps {
            run_store: &store,
            lock_store: &lock,
            state_root: td.path(),
            storage: &storage,
            fetcher: &fetcher,
            feeds: &feeds,
            notifier: &notifier,
            sftp: &config.sftp,
            config: &config,
        };
        let mut reporter = crate::reporter::NullReporter;
        let result = tick(&deps, Uuid::new_v4(), Uuid::new_v4(), Utc::now(), &mut reporter);
        assert!(result.is_err());
    }

    #[test]
    fn tick_fails_the_run_when_import_ftp_cannot_read_its_feeds() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let lock = LockStore::new(td.path());
        let storage = FileStorage::new(td.path().join("objects"));
        let fetcher = HttpRangeFetcher::new();
        // No stock.csv/price.csv written: import_ftp must fail cleanly.
        let feeds = FixedFeedSource { dir: td.path().join("missing-drop") };
        let notifier = NullNotifier;
        let config = ConveyorConfig::default();
        let deps = TickDeps {
            run_store: &store,
            lock_store: &lock,
            state_root: td.path(),
            storage: &storage,
            fetcher: &fetcher,
            feeds: &feeds,
            notifier: &notifier,
            sftp: &config.sftp,
            config: &config,
        };

        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let response = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();

        assert_eq!(response.status, TickStatus::FailedDefinitive);
        let record = store.load(run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(!lock.is_locked(Utc::now()).unwrap());
    }

    #[test]
    fn already_finished_run_short_circuits_without_locking() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let lock = LockStore::new(td.path());
        let storage = FileStorage::new(td.path().join("objects"));
        let fetcher = HttpRangeFetcher::new();
        let feeds = FixedFeedSource { dir: td.path().to_path_buf() };
        let notifier = NullNotifier;
        let config = ConveyorConfig::default();
        let deps = TickDeps {
            run_store: &store,
            lock_store: &lock,
            state_root: td.path(),
            storage: &storage,
            fetcher: &fetcher,
            feeds: &feeds,
            notifier: &notifier,
            sftp: &config.sftp,
            config: &config,
        };

        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        store.finalize(run_id, RunStatus::Success, 0, None).unwrap();

        let mut reporter = crate::reporter::NullReporter;
        let response = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(response.status, TickStatus::AlreadyFinished);
        assert!(!lock.is_locked(Utc::now()).unwrap());
    }

    struct MaterialUrlFeedSource {
        dir: std::path::PathBuf,
        material_url: String,
    }

    impl FeedSource for MaterialUrlFeedSource {
        fn fetch_stock_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            std::fs::read(self.dir.join("stock.csv"))
                .map_err(|e| crate::sources::FeedError::Io { path: "stock.csv".into(), source: e })
        }
        fn fetch_price_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            std::fs::read(self.dir.join("price.csv"))
                .map_err(|e| crate::sources::FeedError::Io { path: "price.csv".into(), source: e })
        }
        fn fetch_location_feed(&self) -> Result<Vec<u8>, crate::sources::FeedError> {
            Err(crate::sources::FeedError::NotConfigured("location".into()))
        }
        fn material_url(&self) -> Result<String, crate::sources::FeedError> {
            Ok(self.material_url.clone())
        }
    }

    /// Scenario C: a `546 WORKER_LIMIT` hit on `parse_merge`'s material HEAD
    /// probe schedules a retry rather than failing the run, and the
    /// previously-persisted sub-phase progress survives the RetryDelay
    /// round trip.
    #[test]
    fn worker_limit_on_parse_merge_schedules_a_retry_delay() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("stock.csv"), "Matnr;Stock\n1;5\n").unwrap();
        std::fs::write(td.path().join("price.csv"), "Matnr;ListPrice\n1;10\n").unwrap();

        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_data(b"WORKER_LIMIT exceeded".to_vec()).with_status_code(546);
                let _ = request.respond(response);
            }
        });

        let store = RunStore::new(td.path());
        let lock = LockStore::new(td.path());
        let storage = FileStorage::new(td.path().join("objects"));
        let fetcher = HttpRangeFetcher::new();
        let feeds = MaterialUrlFeedSource { dir: td.path().to_path_buf(), material_url: format!("http://{addr}/material.txt") };
        let notifier = NullNotifier;
        let config = ConveyorConfig::default();
        let deps = TickDeps {
            run_store: &store,
            lock_store: &lock,
            state_root: td.path(),
            storage: &storage,
            fetcher: &fetcher,
            feeds: &feeds,
            notifier: &notifier,
            sftp: &config.sftp,
            config: &config,
        };

        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        let mut reporter = crate::reporter::NullReporter;

        // tick 1: import_ftp completes.
        let r1 = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(r1.status, TickStatus::Yielded);
        // tick 2: parse_merge building_stock_index -> building_price_index.
        let r2 = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(r2.status, TickStatus::Yielded);
        // tick 3: building_price_index -> preparing_material.
        let r3 = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(r3.status, TickStatus::Yielded);
        // tick 4: preparing_material's HEAD probe hits the 546 server.
        let r4 = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(r4.status, TickStatus::RetryDelay);

        let record = store.load(run_id).unwrap();
        match record.steps.get(&StepName::ParseMerge) {
            Some(StepState::RetryDelay { retry, .. }) => {
                assert_eq!(retry.retry_attempt, 1);
                assert_eq!(retry.last_http_status, 546);
            }
            other => panic!("expected RetryDelay, got {other:?}"),
        }
        assert_eq!(record.status, RunStatus::Running);

        handle.join().unwrap();
    }

    #[test]
    fn cancelled_run_finalizes_as_failed_with_cancelled_by_user_flag() {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        let lock = LockStore::new(td.path());
        let storage = FileStorage::new(td.path().join("objects"));
        let fetcher = HttpRangeFetcher::new();
        let feeds = FixedFeedSource { dir: td.path().to_path_buf() };
        let notifier = NullNotifier;
        let config = ConveyorConfig::default();
        let deps = TickDeps {
            run_store: &store,
            lock_store: &lock,
            state_root: td.path(),
            storage: &storage,
            fetcher: &fetcher,
            feeds: &feeds,
            notifier: &notifier,
            sftp: &config.sftp,
            config: &config,
        };

        let run_id = start_new_run(&store, TriggerType::Manual, Utc::now()).unwrap();
        store.request_cancel(run_id).unwrap();

        let mut reporter = crate::reporter::NullReporter;
        let response = tick(&deps, run_id, Uuid::new_v4(), Utc::now(), &mut reporter).unwrap();
        assert_eq!(response.status, TickStatus::FailedDefinitive);
        let record = store.load(run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.cancelled_by_user);
        assert_eq!(record.steps.get(&StepName::ImportFtp), Some(&StepState::Failed { reason: "cancelled".to_string() }));
        assert!(!lock.is_locked(Utc::now()).unwrap());
    }
}
