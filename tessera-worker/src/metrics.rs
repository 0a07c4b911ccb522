//! Metrics for the slab worker
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding application.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Metric names as constants
pub mod names {
    // Sector metrics
    pub const SECTORS_UPLOADED: &str = "tessera_sectors_uploaded_total";
    pub const SECTORS_DOWNLOADED: &str = "tessera_sectors_downloaded_total";
    pub const SECTOR_DURATION: &str = "tessera_sector_duration_seconds";

    // Host metrics
    pub const HOST_FAILURES: &str = "tessera_host_failures_total";
    pub const SLOW_HOSTS: &str = "tessera_slow_hosts_total";

    // Slab metrics
    pub const SLABS_UPLOADED: &str = "tessera_slabs_uploaded_total";
    pub const SLABS_DOWNLOADED: &str = "tessera_slabs_downloaded_total";
    pub const SLAB_MIGRATIONS: &str = "tessera_slab_migrations_total";
    pub const SHARDS_MIGRATED: &str = "tessera_shards_migrated_total";
    pub const SECTORS_DELETED: &str = "tessera_sectors_deleted_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    // Sector metrics
    describe_counter!(
        names::SECTORS_UPLOADED,
        "Number of sectors uploaded to hosts"
    );
    describe_counter!(
        names::SECTORS_DOWNLOADED,
        "Number of sector ranges downloaded from hosts"
    );
    describe_histogram!(
        names::SECTOR_DURATION,
        "Duration of a sector operation including lock acquisition, in seconds"
    );

    // Host metrics
    describe_counter!(
        names::HOST_FAILURES,
        "Number of failed shard operations, by operation"
    );
    describe_counter!(
        names::SLOW_HOSTS,
        "Number of shard operations that exceeded the sector timeout"
    );

    // Slab metrics
    describe_counter!(names::SLABS_UPLOADED, "Number of slabs uploaded");
    describe_counter!(names::SLABS_DOWNLOADED, "Number of slab slices downloaded");
    describe_counter!(
        names::SLAB_MIGRATIONS,
        "Number of slabs that needed shards migrated"
    );
    describe_counter!(names::SHARDS_MIGRATED, "Number of shards migrated");
    describe_counter!(
        names::SECTORS_DELETED,
        "Number of sector roots sent in delete batches"
    );
}

/// Record a successful sector operation
pub(crate) fn record_sector(op: &'static str, elapsed: Duration) {
    let name = match op {
        "upload" => names::SECTORS_UPLOADED,
        _ => names::SECTORS_DOWNLOADED,
    };
    counter!(name).increment(1);
    histogram!(names::SECTOR_DURATION, "op" => op).record(elapsed.as_secs_f64());
}

/// Record a failed or slow shard operation
pub(crate) fn record_host_error(op: &'static str, slow: bool) {
    if slow {
        counter!(names::SLOW_HOSTS, "op" => op).increment(1);
    } else {
        counter!(names::HOST_FAILURES, "op" => op).increment(1);
    }
}
