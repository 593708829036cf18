mod common;

use common::{Harness, MockArchive, MockMetric};
use metricshed_core::RefreshConfig;

const T0: i64 = 1_000_000;

fn basic_archive() -> MockArchive {
    MockArchive::new("host1", T0 - 7200, T0 - 600)
        .metric(MockMetric::counter("kernel.cpu"))
        .metric(MockMetric::instant("mem.free"))
}

#[tokio::test]
async fn new_archive_is_indexed_with_pseudo_metric() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());

    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").expect("entry created");
    assert_eq!(entry.name_prefix, "host1");
    assert_eq!(entry.begin, T0 - 7200);
    assert_eq!(entry.end, T0 - 600);
    let names: Vec<String> = entry.metrics.iter().map(|m| m.unsplit()).collect();
    assert_eq!(names, vec!["_", "kernel.cpu", "mem.free"]);
    assert_eq!(h.cache.entries_for_prefix("host1").len(), 1);
}

#[tokio::test]
async fn non_numeric_metrics_are_skipped() {
    let h = Harness::new(T0);
    h.backend.add(
        "host1.meta",
        basic_archive().metric(MockMetric::text("build.version")),
    );

    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").unwrap();
    assert!(!entry.metrics.iter().any(|m| m.unsplit().contains("build")));
}

#[tokio::test]
async fn domain_metrics_expand_to_encoded_members() {
    let h = Harness::new(T0);
    h.backend.add(
        "host1.meta",
        MockArchive::new("host1", T0 - 7200, T0 - 600)
            .domain(7, &["cpu0", "cpu:1"])
            .metric(MockMetric::instant("percpu.busy").with_domain(7)),
    );

    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").unwrap();
    let names: Vec<String> = entry.metrics.iter().map(|m| m.unsplit()).collect();
    // the colon in cpu:1 is escaped so the member stays one dot-component
    assert_eq!(names, vec!["_", "percpu.busy.cpu0", "percpu.busy.cpu~3A1"]);
}

#[tokio::test]
async fn freshness_heuristic_skips_io_inside_the_window() {
    let h = Harness::new(T0);
    // quiet for d = 1000s at first refresh: volume mtime T0-1000
    let d = 1000;
    let mut archive = basic_archive();
    archive.metadata_mtime = T0 - 5000;
    archive.volumes.insert(0, T0 - d);
    h.backend.add("host1.meta", archive);

    h.refresher.refresh_one("host1.meta").await;
    let entry = h.cache.get("host1.meta").unwrap();
    assert_eq!(entry.last_refresh_time, T0);
    assert_eq!(entry.last_volume_mtime, T0 - d);

    // inside the assumed-fresh window: no stat, no open
    let stats_before = h.backend.stats();
    let opens_before = h.backend.opens();
    h.clock.set(T0 + (2 * d) / 5); // T0 + 0.4*d
    h.refresher.refresh_one("host1.meta").await;
    assert_eq!(h.backend.stats(), stats_before);
    assert_eq!(h.backend.opens(), opens_before);

    // past the window: the stat happens again
    h.clock.set(T0 + (3 * d) / 5); // T0 + 0.6*d
    h.refresher.refresh_one("host1.meta").await;
    assert!(h.backend.stats() > stats_before);
}

#[tokio::test]
async fn vanished_archive_is_evicted_from_both_indices() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;
    assert!(h.cache.get("host1.meta").is_some());

    h.backend.remove("host1.meta");
    h.clock.advance(5000);
    h.refresher.refresh_one("host1.meta").await;

    assert!(h.cache.get("host1.meta").is_none());
    assert!(h.cache.entries_for_prefix("host1").is_empty());

    // it must not reappear without a fresh open
    let opens_before = h.backend.opens();
    h.refresher.refresh_one("host1.meta").await;
    assert!(h.cache.get("host1.meta").is_none());
    assert_eq!(h.backend.opens(), opens_before + 1); // failed open attempt
}

#[tokio::test]
async fn metadata_change_reloads_the_metric_list() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;
    assert_eq!(h.cache.get("host1.meta").unwrap().metrics.len(), 3);

    // new metric appears and the metadata file is rewritten
    h.backend.add(
        "host1.meta",
        basic_archive().metric(MockMetric::instant("net.bytes")),
    );
    h.backend.touch_metadata("host1.meta", T0 + 100);
    h.clock.advance(5000);
    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").unwrap();
    assert_eq!(entry.metrics.len(), 4);
    assert_eq!(entry.metadata_mtime, T0 + 100);
}

#[tokio::test]
async fn unchanged_metadata_keeps_the_cached_metric_list() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;
    let opens_after_first = h.backend.opens();

    // volume unchanged, metadata unchanged: the next refresh stats but
    // does not reopen
    h.clock.advance(100_000);
    h.refresher.refresh_one("host1.meta").await;
    assert_eq!(h.backend.opens(), opens_after_first);
}

#[tokio::test]
async fn growing_volume_updates_the_end_time() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;
    assert_eq!(h.cache.get("host1.meta").unwrap().end, T0 - 600);

    // the active volume grows
    h.backend.set_end("host1.meta", T0 + 900);
    h.backend.touch_volume("host1.meta", 0, T0 + 900);
    h.clock.advance(100_000);
    h.refresher.refresh_one("host1.meta").await;

    assert_eq!(h.cache.get("host1.meta").unwrap().end, T0 + 900);
}

#[tokio::test]
async fn volume_rollover_advances_the_tracked_index() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;
    assert_eq!(h.cache.get("host1.meta").unwrap().last_volume_index, 0);

    h.backend.touch_volume("host1.meta", 1, T0 + 50);
    h.backend.set_end("host1.meta", T0 + 50);
    h.clock.advance(100_000);
    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").unwrap();
    assert_eq!(entry.last_volume_index, 1);
    assert_eq!(entry.last_volume_mtime, T0 + 50);
    assert_eq!(entry.end, T0 + 50);
}

#[tokio::test]
async fn open_failure_during_volume_check_poisons_the_end_time() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;

    // archive grows but can no longer be opened
    h.backend.touch_volume("host1.meta", 0, T0 + 10);
    h.backend.fail_open("host1.meta");
    h.clock.advance(100_000);
    h.refresher.refresh_one("host1.meta").await;

    let entry = h.cache.get("host1.meta").unwrap();
    assert_eq!(entry.end, 0, "end time must be poisoned, not stale");
}

#[tokio::test]
async fn refresh_all_is_rate_limited() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());

    h.refresher.refresh_all().await;
    assert!(h.cache.get("host1.meta").is_some());

    // a second archive appears, but the window has not elapsed
    h.backend.add("host2.meta", MockArchive::new("host2", T0 - 100, T0));
    h.clock.advance(30);
    h.refresher.refresh_all().await;
    assert!(h.cache.get("host2.meta").is_none());

    // past the interval the rescan picks it up
    h.clock.advance(31);
    h.refresher.refresh_all().await;
    assert!(h.cache.get("host2.meta").is_some());
}

#[tokio::test]
async fn residual_rescan_evicts_archives_the_walk_missed() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_all().await;
    assert!(h.cache.get("host1.meta").is_some());

    // the archive vanishes entirely; the walk no longer reports it, but
    // phase 2 revisits it and finds the stat failing
    h.backend.remove("host1.meta");
    h.clock.advance(5000);
    h.refresher.refresh_all().await;
    assert!(h.cache.get("host1.meta").is_none());
}

#[tokio::test]
async fn shutdown_refresh_evicts_entries() {
    let h = Harness::new(T0);
    h.backend.add("host1.meta", basic_archive());
    h.refresher.refresh_one("host1.meta").await;

    h.shutdown.trigger();
    h.refresher.refresh_one("host1.meta").await;
    assert!(h.cache.get("host1.meta").is_none());
}

#[tokio::test]
async fn host_prefixes_use_the_one_way_encoding() {
    let config = RefreshConfig {
        prefix_source: metricshed_core::PrefixSource::Host,
        ..RefreshConfig::default()
    };
    let h = Harness::with_config(T0, config);
    h.backend.add(
        "some/dir/archive.meta",
        MockArchive::new("web.example.com", T0 - 100, T0)
            .metric(MockMetric::instant("mem.free")),
    );

    h.refresher.refresh_one("some/dir/archive.meta").await;
    let entry = h.cache.get("some/dir/archive.meta").unwrap();
    assert_eq!(entry.name_prefix, "web_example_com");
}
