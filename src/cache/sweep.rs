use super::NorthCache;
use crate::config::{ArchiveSettings, ErrorStoreSettings};
use crate::error::CacheResult;
use crate::model::{CacheStore, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub archive_removed: usize,
    pub error_removed: usize,
    pub quarantined: usize,
}

/// Applies archive and error-store retention to one North cache.
///
/// Unparsable metadata is moved to the error store first. With archiving disabled the
/// archive store is emptied. A retention of zero keeps entries forever.
pub fn sweep_north(
    cache: &NorthCache,
    archive: &ArchiveSettings,
    error: &ErrorStoreSettings,
    now: Instant,
) -> CacheResult<SweepReport> {
    let quarantined = cache.quarantine_corrupt()?;
    let archive_removed = if !archive.enabled {
        cache.remove_all(CacheStore::Archive)?
    } else if archive.retention_duration > 0 {
        cache.purge_older_than(CacheStore::Archive, now - hours(archive.retention_duration))?
    } else {
        0
    };
    let error_removed = if error.retention_hours > 0 {
        cache.purge_older_than(CacheStore::Error, now - hours(error.retention_hours))?
    } else {
        0
    };
    if archive_removed + error_removed > 0 {
        tracing::info!(north = %cache.north_id(), archive_removed, error_removed, "cache retention applied");
    }
    Ok(SweepReport {
        archive_removed,
        error_removed,
        quarantined,
    })
}

// About a century; keeps the cutoff representable.
const MAX_RETENTION_HOURS: u64 = 876_000;

fn hours(value: u64) -> chrono::Duration {
    chrono::Duration::hours(value.min(MAX_RETENTION_HOURS) as i64)
}
