//! Drives a batch of sites through fetch, extraction and classification,
//! then groups the run and validates the resulting candidate groups.
//!
//! Every site gets its own task. Fetches share one [`FetchThrottle`] so the
//! concurrency and requests-per-minute limits hold for the whole run. Each
//! site's outcome is written in a single transaction, so an aborted run never
//! leaves half-written artifacts behind.

use crate::classify;
use crate::data::{Database, MappedSite};
use crate::error::{LotmapError, Result};
use crate::grouping::{self, GroupingSummary};
use crate::model::{GroupStatus, RunStatus, Site};
use crate::template;
use crate::validation::{self, ValidationOutcome, Validator};
use backoff::ExponentialBackoff;
use backoff::future::retry_notify;
use lotmap_scanner::{FetchError, FetchOptions, FetchThrottle, MapResult, ThrottleGuard, UrlMapper};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A transient failure on this attempt is final.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Error recorded on a run stopped through its abort flag.
pub const ABORTED: &str = "aborted";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(30_000),
            max_attempts: MAX_FETCH_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Doubling backoff without jitter or an elapsed-time cap; the attempt
    /// count is what bounds retries.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Progress notifications emitted while a run is in flight.
#[derive(Debug, Clone)]
pub enum RunEvent {
    SiteStarted {
        site_id: i64,
        domain: String,
    },
    Retrying {
        domain: String,
        attempt: u32,
        delay: Duration,
        error: FetchError,
    },
    SiteMapped {
        domain: String,
        urls: usize,
        eligible: bool,
    },
    SiteFailed {
        domain: String,
        error: FetchError,
    },
    SiteSkipped {
        domain: String,
    },
}

/// Callback for reporting run progress
pub type RunProgressCallback = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Options for a map run
pub struct RunOptions {
    pub site_ids: Vec<i64>,
    pub concurrency: usize,
    /// Requests per minute across the whole run; 0 disables the ceiling.
    pub rate_limit: u32,
    pub fetch: FetchOptions,
    pub retry: RetryPolicy,
    /// Raise to stop starting new sites.
    pub abort: Option<Arc<AtomicBool>>,
    pub progress: Option<RunProgressCallback>,
}

impl RunOptions {
    pub fn new(site_ids: Vec<i64>) -> Self {
        Self {
            site_ids,
            concurrency: 5,
            rate_limit: 60,
            fetch: FetchOptions::default(),
            retry: RetryPolicy::default(),
            abort: None,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub sites_success: usize,
    pub sites_failed: usize,
    /// Sites never started because the run was aborted; they stay `pending`.
    pub sites_skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub run: RunSummary,
    pub grouping: Option<GroupingSummary>,
    pub validations: Vec<ValidationOutcome>,
}

#[derive(Default)]
struct RunCounters {
    success: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

struct RunContext {
    run_id: String,
    db: Arc<Mutex<Database>>,
    mapper: Arc<dyn UrlMapper>,
    throttle: FetchThrottle,
    fetch: FetchOptions,
    retry: RetryPolicy,
    abort: Arc<AtomicBool>,
    fatal: OnceLock<String>,
    counters: RunCounters,
    progress: Option<RunProgressCallback>,
}

impl RunContext {
    fn emit(&self, event: RunEvent) {
        if let Some(cb) = &self.progress {
            cb(event);
        }
    }
}

/// Fetch one domain, retrying transient failures with exponential backoff.
///
/// Every attempt holds a throttle slot; `first_slot` lets the caller hand in
/// the slot it already waited for. Never returns more than
/// `policy.max_attempts` attempts.
pub async fn fetch_with_retry<N>(
    mapper: &dyn UrlMapper,
    throttle: &FetchThrottle,
    first_slot: Option<ThrottleGuard>,
    domain: &str,
    options: &FetchOptions,
    policy: &RetryPolicy,
    mut on_retry: N,
) -> MapResult
where
    N: FnMut(&FetchError, u32, Duration),
{
    let started = Instant::now();
    let counter = AtomicU32::new(0);
    let attempts = &counter;
    let max_attempts = policy.max_attempts.max(1);
    let mut first_slot = first_slot;

    let outcome = retry_notify(
        policy.backoff(),
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let held = first_slot.take();
            async move {
                let _slot = match held {
                    Some(slot) => slot,
                    None => throttle.acquire().await,
                };
                debug!("Fetching {} (attempt {}/{})", domain, attempt, max_attempts);

                match mapper.fetch_urls(domain, options).await {
                    Ok(urls) => Ok(urls),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        move |e: FetchError, delay: Duration| {
            on_retry(&e, attempts.load(Ordering::SeqCst), delay);
        },
    )
    .await;

    let attempts = counter.load(Ordering::SeqCst);
    match outcome {
        Ok(urls) => MapResult::new(domain.to_string(), urls, attempts, started.elapsed()),
        Err(e) => MapResult::with_error(domain.to_string(), e, attempts, started.elapsed()),
    }
}

async fn process_site(ctx: Arc<RunContext>, site: Site) -> Result<()> {
    let slot = ctx.throttle.acquire().await;
    if ctx.abort.load(Ordering::SeqCst) {
        ctx.counters.skipped.fetch_add(1, Ordering::SeqCst);
        debug!("Run {} aborted, skipping {}", ctx.run_id, site.domain);
        ctx.emit(RunEvent::SiteSkipped {
            domain: site.domain.clone(),
        });
        return Ok(());
    }

    ctx.db.lock().await.mark_site_mapping(site.id)?;
    ctx.emit(RunEvent::SiteStarted {
        site_id: site.id,
        domain: site.domain.clone(),
    });

    let result = fetch_with_retry(
        ctx.mapper.as_ref(),
        &ctx.throttle,
        Some(slot),
        &site.domain,
        &ctx.fetch,
        &ctx.retry,
        |e, attempt, delay| {
            warn!(
                "Fetch of {} failed on attempt {}: {}. Retrying in {:.1}s",
                site.domain,
                attempt,
                e,
                delay.as_secs_f32()
            );
            ctx.emit(RunEvent::Retrying {
                domain: site.domain.clone(),
                attempt,
                delay,
                error: e.clone(),
            });
        },
    )
    .await;

    match result.error {
        None => {
            let templates = template::extract(&result.urls);
            let classification = classify::classify(templates.keys());

            ctx.db.lock().await.record_site_mapped(
                &ctx.run_id,
                site.id,
                &MappedSite {
                    urls: &result.urls,
                    attempts: result.attempts,
                    templates: &templates,
                    classification: &classification,
                },
            )?;
            ctx.counters.success.fetch_add(1, Ordering::SeqCst);

            info!(
                "Mapped {}: {} URLs, {} templates, eligible={} ({} attempts, {:.1}s)",
                site.domain,
                result.urls.len(),
                templates.len(),
                classification.eligible,
                result.attempts,
                result.elapsed.as_secs_f32()
            );
            ctx.emit(RunEvent::SiteMapped {
                domain: site.domain.clone(),
                urls: result.urls.len(),
                eligible: classification.eligible,
            });
        }
        Some(err) => {
            ctx.db
                .lock()
                .await
                .record_site_failed(&ctx.run_id, site.id, &err, result.attempts)?;
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);

            warn!(
                "Failed to map {} after {} attempts: {}",
                site.domain, result.attempts, err
            );
            if err.is_fatal() {
                error!("Mapping service unusable, aborting run {}", ctx.run_id);
                let _ = ctx.fatal.set(err.to_string());
                ctx.abort.store(true, Ordering::SeqCst);
            }
            ctx.emit(RunEvent::SiteFailed {
                domain: site.domain.clone(),
                error: err,
            });
        }
    }

    Ok(())
}

/// Map every site in `options.site_ids` under one run.
pub async fn run_map(
    db: Arc<Mutex<Database>>,
    mapper: Arc<dyn UrlMapper>,
    options: RunOptions,
) -> Result<RunSummary> {
    let RunOptions {
        site_ids,
        concurrency,
        rate_limit,
        fetch,
        retry,
        abort,
        progress,
    } = options;

    let mut seen = HashSet::new();
    let site_ids: Vec<i64> = site_ids.into_iter().filter(|id| seen.insert(*id)).collect();

    let (run_id, sites) = {
        let mut db = db.lock().await;
        let mut sites = Vec::with_capacity(site_ids.len());
        for id in &site_ids {
            let site = db
                .get_site(*id)?
                .ok_or_else(|| LotmapError::NotFound(format!("site {}", id)))?;
            sites.push(site);
        }
        let run_id = db.create_run(&site_ids, concurrency, rate_limit)?;
        (run_id, sites)
    };

    info!(
        "Starting run {} over {} sites (concurrency {}, {} req/min)",
        run_id,
        sites.len(),
        concurrency,
        rate_limit
    );

    let ctx = Arc::new(RunContext {
        run_id: run_id.clone(),
        db: db.clone(),
        mapper,
        throttle: FetchThrottle::new(concurrency, rate_limit),
        fetch,
        retry,
        abort: abort.unwrap_or_default(),
        fatal: OnceLock::new(),
        counters: RunCounters::default(),
        progress,
    });

    let handles: Vec<_> = sites
        .into_iter()
        .map(|site| tokio::spawn(process_site(ctx.clone(), site)))
        .collect();

    let mut task_error: Option<LotmapError> = None;
    for joined in futures::future::join_all(handles).await {
        let outcome = joined.map_err(LotmapError::from).and_then(|r| r);
        if let Err(e) = outcome {
            error!("Site task failed in run {}: {}", run_id, e);
            ctx.abort.store(true, Ordering::SeqCst);
            task_error.get_or_insert(e);
        }
    }

    let sites_success = ctx.counters.success.load(Ordering::SeqCst);
    let sites_failed = ctx.counters.failed.load(Ordering::SeqCst);
    let sites_skipped = ctx.counters.skipped.load(Ordering::SeqCst);

    let error = match (&task_error, ctx.fatal.get()) {
        (Some(e), _) => Some(e.to_string()),
        (None, Some(fatal)) => Some(fatal.clone()),
        (None, None) if sites_skipped > 0 => Some(ABORTED.to_string()),
        (None, None) => None,
    };
    let status = if error.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Done
    };

    db.lock()
        .await
        .finish_run(&run_id, status, error.as_deref())?;

    if let Some(e) = task_error {
        return Err(e);
    }

    info!(
        "Run {} finished {}: {} mapped, {} failed, {} skipped",
        run_id, status, sites_success, sites_failed, sites_skipped
    );

    Ok(RunSummary {
        run_id,
        status,
        sites_success,
        sites_failed,
        sites_skipped,
        error,
    })
}

/// Map, then group the run, then ask `validator` about every candidate group
/// the pass touched. Grouping is skipped when the run did not finish `done`.
pub async fn run_pipeline(
    db: Arc<Mutex<Database>>,
    mapper: Arc<dyn UrlMapper>,
    validator: Option<&dyn Validator>,
    options: RunOptions,
) -> Result<PipelineSummary> {
    let run = run_map(db.clone(), mapper, options).await?;
    if run.status != RunStatus::Done {
        warn!("Run {} did not complete, skipping grouping", run.run_id);
        return Ok(PipelineSummary {
            run,
            grouping: None,
            validations: Vec::new(),
        });
    }

    let mut db = db.lock().await;
    let grouping = grouping::run_grouping(&mut db, &run.run_id)?;

    let mut validations = Vec::new();
    if let Some(validator) = validator {
        for group_id in &grouping.group_ids {
            let is_candidate = db
                .get_group(*group_id)?
                .is_some_and(|g| g.status == GroupStatus::Candidate);
            if is_candidate {
                validations.push(validation::validate_group(&mut db, validator, *group_id).await?);
            }
        }
    }

    Ok(PipelineSummary {
        run,
        grouping: Some(grouping),
        validations,
    })
}
