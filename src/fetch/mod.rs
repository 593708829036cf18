//! Concurrent multi-archive fetch engine.
//!
//! A query's targets are partitioned by owning archive into fetch jobs; a
//! fixed pool of workers plus the calling task pull jobs from a shared queue
//! until it drains.  Job order is unspecified and never matters: every write
//! lands in a per-target slot behind its own lock.  A job captures its own
//! failures into its message and never disturbs other jobs.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::archive::{
    ArchiveBackend, ArchiveHandle, MemberId, MetricDesc, MetricId, Semantics, StorageId,
};
use crate::cache::ArchiveCache;
use crate::codec::{self, EncodingMode};
use crate::enumerate::MetricEnumerator;
use crate::error::{Error, Result};
use crate::name::{MetricName, COVERAGE_METRIC};
use crate::series::TimeSeries;
use crate::shutdown::Shutdown;
use crate::timespec::parse_timespec;

pub const DEFAULT_MAX_POINTS: usize = 1024;

/// Fetch-engine tunables.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Worker-task pool size; the calling task always participates too.
    pub workers: usize,
    /// Preferred sampling step, widened when a window would exceed the
    /// requested point budget.
    pub base_step: i64,
    pub encoding: EncodingMode,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            base_step: 60,
            encoding: EncodingMode::default(),
        }
    }
}

/// A resolved query: concrete targets plus the time grid to fetch them on.
#[derive(Debug)]
pub struct GatheredQuery {
    pub targets: Vec<MetricName>,
    pub t_start: i64,
    pub t_end: i64,
    pub t_step: i64,
    /// Whether either time bound was a relative expression.
    pub relative: bool,
}

/// Output slots for one target, shared between the caller and whichever job
/// serves the target.  Each slot has its own lock so unrelated targets never
/// serialize.
#[derive(Clone)]
struct TargetSlot {
    series: Arc<Mutex<TimeSeries>>,
    desc: Arc<Mutex<Option<MetricDesc>>>,
}

/// One archive's share of a query.
struct FetchJob {
    storage_id: StorageId,
    targets: Vec<MetricName>,
    slots: Vec<TargetSlot>,
    t_start: i64,
    t_end: i64,
    t_step: i64,
}

/// Partitions targets across archives and runs the fetch jobs.
pub struct FetchScheduler {
    cache: Arc<ArchiveCache>,
    backend: Arc<dyn ArchiveBackend>,
    config: FetchConfig,
    shutdown: Shutdown,
}

impl FetchScheduler {
    pub fn new(
        cache: Arc<ArchiveCache>,
        backend: Arc<dyn ArchiveBackend>,
        config: FetchConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            cache,
            backend,
            config,
            shutdown,
        }
    }

    /// Expand target patterns against the cache and fix the query time grid.
    pub async fn gather_targets(
        &self,
        enumerator: &MetricEnumerator,
        patterns: &[String],
        from: &str,
        until: &str,
        max_points: usize,
        now: i64,
    ) -> Result<GatheredQuery> {
        // same defaults dashboards assume
        let from = if from.is_empty() { "-24hour" } else { from };
        let until = if until.is_empty() { "-0hour" } else { until };

        let (t_start, start_relative) = parse_timespec(from, now);
        let (t_end, end_relative) = parse_timespec(until, now);
        let relative = start_relative || end_relative;

        if t_start >= t_end {
            return Err(Error::InvalidInput(format!(
                "empty time window [{}, {}]",
                t_start, t_end
            )));
        }

        let mut targets = Vec::new();
        for pattern in patterns {
            let pattern_depth = pattern.chars().filter(|&c| c == '.').count() + 1;
            let metrics = enumerator.enumerate(pattern, t_start, t_end).await;
            // wildcard expansion can return names deeper than the pattern;
            // keep only those of matching depth
            targets.extend(
                metrics
                    .into_iter()
                    .filter(|m| m.split_size() == pattern_depth),
            );
        }

        let t_step = compute_step(self.config.base_step, t_start, t_end, max_points);
        Ok(GatheredQuery {
            targets,
            t_start,
            t_end,
            t_step,
            relative,
        })
    }

    /// Fetch every target's series over the inclusive grid, concurrently
    /// across archives.
    ///
    /// Returns one series and one optional descriptor per target, in target
    /// order.  Targets that resolve nowhere come back all-NaN with no
    /// descriptor; counter-semantics targets come back rate-converted.
    pub async fn fetch_all_series(
        &self,
        targets: &[MetricName],
        t_start: i64,
        t_end: i64,
        t_step: i64,
    ) -> (Vec<TimeSeries>, Vec<Option<MetricDesc>>) {
        let started = Instant::now();
        let slots: Vec<TargetSlot> = targets
            .iter()
            .map(|_| TargetSlot {
                series: Arc::new(Mutex::new(TimeSeries::new(t_start, t_end, t_step))),
                desc: Arc::new(Mutex::new(None)),
            })
            .collect();

        // Partition targets by owning archive; a prefix may map to several
        // archives, so one target can feed multiple jobs.
        let mut jobmap: BTreeMap<StorageId, FetchJob> = BTreeMap::new();
        for (i, target) in targets.iter().enumerate() {
            let components = target.split();
            let first = match components.first() {
                Some(first) => first,
                None => continue,
            };
            for entry in self.cache.entries_for_prefix(first) {
                if !entry.overlaps(t_start, t_end) {
                    continue;
                }

                // The coverage pseudo-metric needs no archive I/O: mark the
                // overlap of the archive span and the query span.
                if components.len() == 2 && components[1] == COVERAGE_METRIC {
                    *slots[i].desc.lock() = Some(MetricDesc::coverage());
                    let mut series = slots[i].series.lock();
                    let lo = t_start.max(entry.begin);
                    let hi = t_end.min(entry.end);
                    let mut w = lo;
                    while w <= hi {
                        series.set_at(w, 0.0);
                        w += t_step;
                    }
                    continue;
                }

                let job = jobmap
                    .entry(entry.storage_id.clone())
                    .or_insert_with(|| FetchJob {
                        storage_id: entry.storage_id.clone(),
                        targets: Vec::new(),
                        slots: Vec::new(),
                        t_start,
                        t_end,
                        t_step,
                    });
                job.targets.push(target.clone());
                job.slots.push(slots[i].clone());
            }
        }

        let job_count = jobmap.len();
        let queue: Arc<Mutex<VecDeque<FetchJob>>> =
            Arc::new(Mutex::new(jobmap.into_values().collect()));
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_count = self.config.workers.min(job_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let backend = Arc::clone(&self.backend);
            let queue = Arc::clone(&queue);
            let messages = Arc::clone(&messages);
            let shutdown = self.shutdown.clone();
            let encoding = self.config.encoding;
            workers.push(tokio::spawn(async move {
                run_worker(backend, queue, messages, shutdown, encoding).await;
            }));
        }
        // the calling task pulls jobs too
        run_worker(
            Arc::clone(&self.backend),
            Arc::clone(&queue),
            Arc::clone(&messages),
            self.shutdown.clone(),
            self.config.encoding,
        )
        .await;
        let _ = futures::future::join_all(workers).await;

        for message in messages.lock().iter() {
            info!("{}", message);
        }

        let mut out_series = Vec::with_capacity(targets.len());
        let mut out_descs = Vec::with_capacity(targets.len());
        for slot in slots {
            let desc = *slot.desc.lock();
            if matches!(desc, Some(d) if d.semantics == Semantics::Counter) {
                slot.series.lock().rate_convert();
            }
            let series = match Arc::try_unwrap(slot.series) {
                Ok(mutex) => mutex.into_inner(),
                // a job abandoned at shutdown may still hold a reference
                Err(shared) => shared.lock().clone(),
            };
            out_series.push(series);
            out_descs.push(desc);
        }

        debug!(
            targets = targets.len(),
            jobs = job_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetch complete"
        );
        (out_series, out_descs)
    }
}

/// Widen the base step until the inclusive window fits the point budget.
fn compute_step(base_step: i64, t_start: i64, t_end: i64, max_points: usize) -> i64 {
    let max_points = if max_points == 0 {
        DEFAULT_MAX_POINTS
    } else {
        max_points
    } as i64;
    let mut t_step = base_step.max(1);
    if (t_end - t_start) / t_step > max_points {
        t_step = (t_end - t_start) / max_points + 1;
    }
    t_step
}

/// Pull and run jobs until the queue drains or shutdown is requested.
async fn run_worker(
    backend: Arc<dyn ArchiveBackend>,
    queue: Arc<Mutex<VecDeque<FetchJob>>>,
    messages: Arc<Mutex<Vec<String>>>,
    shutdown: Shutdown,
    encoding: EncodingMode,
) {
    loop {
        if shutdown.is_set() {
            break;
        }
        let job = queue.lock().pop_front();
        match job {
            Some(job) => {
                let message = run_fetch_job(backend.as_ref(), &job, &shutdown, encoding).await;
                if !message.is_empty() {
                    messages.lock().push(message);
                }
            }
            None => break,
        }
    }
}

struct ResolvedTarget {
    id: MetricId,
    member: Option<MemberId>,
    desc: MetricDesc,
}

fn check_numeric(
    name: &str,
    id: MetricId,
    member: Option<MemberId>,
    desc: MetricDesc,
) -> std::result::Result<ResolvedTarget, String> {
    if !desc.value_type.is_numeric() {
        return Err(format!(
            " metric {} has unsupported type {:?}",
            name, desc.value_type
        ));
    }
    Ok(ResolvedTarget { id, member, desc })
}

/// Resolve one composite target against an open archive, two ways: first as
/// metric-name + index-domain member, then as a plain metric name.
async fn resolve_target(
    handle: &mut dyn ArchiveHandle,
    components: &[String],
    encoding: EncodingMode,
) -> std::result::Result<ResolvedTarget, String> {
    let joined = components.join(".");
    if components.len() < 2 {
        return Err(format!(" {}: not enough target components", joined));
    }
    if components.iter().any(|c| c.is_empty()) {
        return Err(format!(" {}: empty target components", joined));
    }

    // all components except the archive prefix and the last one
    let middle = components[1..components.len() - 1].join(".");
    let last = &components[components.len() - 1];

    if !middle.is_empty() {
        if let Ok(Some(id)) = handle.lookup_name(&middle).await {
            // found: the last component must name an index-domain member
            let desc = match handle.lookup_desc(id).await {
                Ok(desc) => desc,
                Err(_) => return Err(format!(" cannot find metric descriptor {}", middle)),
            };
            let domain = match desc.domain {
                Some(domain) => domain,
                None => {
                    return Err(format!(
                        " metric {} lacks expected index domain {}",
                        middle, last
                    ))
                }
            };
            let member_label = codec::decode(last, encoding);
            if member_label.is_empty() {
                return Err(format!(
                    " metric {} has undecodable member {}",
                    middle, last
                ));
            }
            let member = match handle.lookup_domain_member(domain, &member_label).await {
                Ok(Some(member)) => member,
                _ => {
                    return Err(format!(
                        " metric {} lacks recognized member {}",
                        middle, last
                    ))
                }
            };
            return check_numeric(&middle, id, Some(member), desc);
        }
    }

    // not found: retry with the last component folded into the metric name
    let full = if middle.is_empty() {
        last.to_string()
    } else {
        format!("{}.{}", middle, last)
    };
    let id = match handle.lookup_name(&full).await {
        Ok(Some(id)) => id,
        _ => return Err(format!(" cannot find metric name {}", full)),
    };
    let desc = match handle.lookup_desc(id).await {
        Ok(desc) => desc,
        Err(_) => return Err(format!(" cannot find metric descriptor {}", full)),
    };
    if desc.domain.is_some() {
        return Err(format!(" metric {} has unexpected index domain", full));
    }
    check_numeric(&full, id, None, desc)
}

/// Run one archive's fetch job to completion, returning its diagnostic
/// message (empty when there is nothing to report).
async fn run_fetch_job(
    backend: &dyn ArchiveBackend,
    job: &FetchJob,
    shutdown: &Shutdown,
    encoding: EncodingMode,
) -> String {
    let mut message = String::new();

    let mut handle = match backend.open(&job.storage_id).await {
        Ok(handle) => handle,
        Err(e) => {
            debug!(archive = %job.storage_id, error = %e, "cannot open archive for fetch");
            return format!("{}: cannot open archive", job.storage_id);
        }
    };
    let archive_begin = handle.begin_time();
    let archive_end = match handle.end_time().await {
        Ok(end) => end,
        Err(_) => return format!("{}: cannot find archive end", job.storage_id),
    };

    // per-target metadata resolution
    let target_count = job.targets.len();
    let mut ids: Vec<Option<MetricId>> = vec![None; target_count];
    let mut members: Vec<Option<MemberId>> = vec![None; target_count];
    for (j, target) in job.targets.iter().enumerate() {
        if shutdown.is_set() {
            break;
        }
        let components = target.split();
        match resolve_target(handle.as_mut(), &components, encoding).await {
            Ok(resolved) => {
                ids[j] = Some(resolved.id);
                members[j] = resolved.member;
                *job.slots[j].desc.lock() = Some(resolved.desc);
            }
            Err(reason) => message.push_str(&reason),
        }
    }

    // Distinct targets may share one underlying id with different members;
    // fetch each id once per tick and search the result per target.
    let unique_ids: Vec<MetricId> = ids
        .iter()
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut interpolation_set = false;
    let mut ticks: u64 = 0;
    let mut values_good: u64 = 0;
    let mut t = job.t_start;
    while t <= job.t_end {
        if shutdown.is_set() {
            break;
        }
        // only fetch within the archive's own bounds
        if t >= archive_begin && t <= archive_end && !unique_ids.is_empty() {
            if !interpolation_set {
                handle.set_interpolation(t, job.t_step);
                interpolation_set = true;
            }
            if let Ok(samples) = handle.fetch_interpolated(&unique_ids).await {
                for (j, slot) in job.slots.iter().enumerate() {
                    let id = match ids[j] {
                        Some(id) => id,
                        None => continue,
                    };
                    if let Some(sample) = samples
                        .iter()
                        .find(|s| s.id == id && s.member == members[j])
                    {
                        // overwrite the pre-prepared NaN with a real value
                        slot.series.lock().set_at(t, sample.value);
                        values_good += 1;
                    }
                }
            }
        }
        ticks += 1;
        t += job.t_step;
    }

    let total_slots = ticks * target_count as u64;
    debug!(
        archive = %job.storage_id,
        targets = target_count,
        unique = unique_ids.len(),
        values = values_good,
        slots = total_slots,
        "fetch job finished"
    );
    if values_good == 0 {
        message.push_str(&format!(
            " {} target(s) ({} unique metrics), {}/{} values",
            target_count,
            unique_ids.len(),
            values_good,
            total_slots
        ));
    }

    if message.is_empty() {
        String::new()
    } else {
        format!("{}:{}", job.storage_id, message)
    }
}
