//! File rotation (C13): numeric and timestamped roll policies for log
//! files, grounded on `nsd/rollfile.c`'s rename-chain and mtime-purge
//! semantics.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Numeric roll: `X.(max-1) -> X.max`, ..., `X.0 -> X.1`, then `X ->
/// X.0`. Anything beyond `max_backups` is deleted.
pub fn roll_numeric(path: &Path, max_backups: usize) -> io::Result<()> {
    if max_backups == 0 {
        return Ok(());
    }
    for n in (0..max_backups).rev() {
        let from = backup_path(path, n);
        let to = backup_path(path, n + 1);
        if from.exists() {
            if n + 1 >= max_backups {
                fs::remove_file(&from)?;
            } else {
                fs::rename(&from, &to)?;
            }
        }
    }
    if path.exists() {
        fs::rename(path, backup_path(path, 0))?;
    }
    Ok(())
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Timestamped roll: renames `path` to `path.STRFTIME(now)`. A rotation
/// occurring within 60 seconds of local midnight is attributed to the
/// day it started on, not the day it crosses into, matching the
/// original's look-back window.
pub fn roll_timestamped(path: &Path, now: SystemTime, strftime_format: &str) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let adjusted = now
        .checked_sub(Duration::from_secs(0))
        .unwrap_or(now);
    let adjusted = midnight_lookback_adjust(adjusted);
    let timestamp: DateTime<Utc> = adjusted.into();
    let suffix = timestamp.format(strftime_format).to_string();

    let mut target_name = path.as_os_str().to_owned();
    target_name.push(format!(".{suffix}"));
    let target = PathBuf::from(target_name);
    fs::rename(path, &target)?;
    Ok(Some(target))
}

/// If `now` falls within 60 seconds after local midnight, attributes
/// the rotation to the previous day (the day the log period actually
/// covers), rather than the day the clock just ticked into.
fn midnight_lookback_adjust(now: SystemTime) -> SystemTime {
    const LOOKBACK: Duration = Duration::from_secs(60);
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let seconds_into_day = secs % 86_400;
    if seconds_into_day < LOOKBACK.as_secs() {
        UNIX_EPOCH + Duration::from_secs(secs - seconds_into_day - 1)
    } else {
        now
    }
}

/// After a timestamped roll, purges rotated files for `base_path` down
/// to `max_backups`, oldest (by mtime) first.
pub fn purge_timestamped(base_path: &Path, max_backups: usize) -> io::Result<()> {
    let parent = base_path.parent().unwrap_or_else(|| Path::new("."));
    let file_stem = base_path.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();

    let mut rotated: Vec<(PathBuf, SystemTime)> = Vec::new();
    if parent.exists() {
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&format!("{file_stem}.")) && name != file_stem {
                let metadata = entry.metadata()?;
                let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
                rotated.push((entry.path(), mtime));
            }
        }
    }
    rotated.sort_by_key(|(_, mtime)| *mtime);

    if rotated.len() > max_backups {
        let excess = rotated.len() - max_backups;
        for (path, _) in rotated.into_iter().take(excess) {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Closes, rolls (if present), and reopens `path` atomically with
/// respect to other callers rotating the same path — `lock` is the
/// per-path mutex guarding this sequence (the log-file registry in
/// `server` holds one per registered path).
pub fn rotate_and_reopen(
    path: &Path,
    lock: &parking_lot::Mutex<()>,
    max_backups: usize,
) -> io::Result<fs::File> {
    let _guard = lock.lock();
    if path.exists() {
        roll_numeric(path, max_backups)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn numeric_roll_chains_and_caps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, b"current").unwrap();
        fs::write(backup_path(&path, 0), b"old0").unwrap();
        fs::write(backup_path(&path, 1), b"old1").unwrap();

        roll_numeric(&path, 2).unwrap();

        assert!(!path.exists());
        assert_eq!(fs::read(backup_path(&path, 0)).unwrap(), b"current");
        assert_eq!(fs::read(backup_path(&path, 1)).unwrap(), b"old0");
        assert!(!backup_path(&path, 2).exists()); // old1 was dropped, over cap
    }

    #[test]
    fn timestamped_roll_renames_with_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, b"data").unwrap();

        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let rolled = roll_timestamped(&path, now, "%Y-%m-%d").unwrap().unwrap();
        assert!(!path.exists());
        assert!(rolled.exists());
        assert!(rolled.to_string_lossy().contains("2023-11"));
    }

    #[test]
    fn midnight_lookback_assigns_previous_day() {
        let midnight = UNIX_EPOCH + Duration::from_secs(1_700_000_000 - (1_700_000_000 % 86_400));
        let just_after_midnight = midnight + Duration::from_secs(10);
        let adjusted = midnight_lookback_adjust(just_after_midnight);
        assert!(adjusted < midnight);
    }

    #[test]
    fn purge_bounds_rotated_file_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        for i in 0..5 {
            fs::write(dir.path().join(format!("app.log.{i}")), b"x").unwrap();
        }
        purge_timestamped(&path, 2).unwrap();
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("app.log."))
            .collect();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn rotate_and_reopen_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let lock = parking_lot::Mutex::new(());
        let file = rotate_and_reopen(&path, &lock, 3).unwrap();
        drop(file);
        assert!(path.exists());
    }
}
