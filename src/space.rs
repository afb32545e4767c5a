use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_LOW_SPACE_THRESHOLD_PERCENT: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct SpaceInfo {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub used_percent: f64,
    pub free_percent: f64,
    pub is_low_space: bool,
    pub threshold_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceCheck {
    pub has_enough_space: bool,
    pub free_percent: f64,
    pub free_bytes: u64,
    pub warning: Option<String>,
}

impl SpaceCheck {
    fn unknown() -> Self {
        Self {
            has_enough_space: true,
            free_percent: 100.0,
            free_bytes: 0,
            warning: None,
        }
    }
}

/// Raw capacity of a filesystem, as reported by the platform.
pub trait FilesystemStats: Send + Sync {
    fn capacity(&self, path: &Path) -> Option<(u64, u64)>;
}

pub struct Statvfs;

impl FilesystemStats for Statvfs {
    #[cfg(unix)]
    fn capacity(&self, path: &Path) -> Option<(u64, u64)> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path_c = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::statvfs(path_c.as_ptr(), &mut stat) };
        if result != 0 {
            warn!("statvfs failed for {}", path.display());
            return None;
        }

        let total = (stat.f_blocks as u64) * (stat.f_frsize as u64);
        let free = (stat.f_bavail as u64) * (stat.f_frsize as u64);
        Some((total, free))
    }

    #[cfg(not(unix))]
    fn capacity(&self, _path: &Path) -> Option<(u64, u64)> {
        None
    }
}

/// Advisory free-space check for local base paths. Never fails a backup.
pub struct SpaceMonitor {
    threshold_percent: f64,
    stats: Box<dyn FilesystemStats>,
}

impl SpaceMonitor {
    pub fn new(threshold_percent: f64) -> Self {
        Self::with_stats(threshold_percent, Box::new(Statvfs))
    }

    pub fn with_stats(threshold_percent: f64, stats: Box<dyn FilesystemStats>) -> Self {
        Self {
            threshold_percent,
            stats,
        }
    }

    pub fn threshold_percent(&self) -> f64 {
        self.threshold_percent
    }

    pub fn space_info(&self, path: &Path) -> Option<SpaceInfo> {
        if !path.exists() {
            return None;
        }
        let (total, free) = self.stats.capacity(path)?;
        if total == 0 {
            return None;
        }

        let used = total.saturating_sub(free);
        let used_percent = used as f64 / total as f64 * 100.0;
        let free_percent = 100.0 - used_percent;

        Some(SpaceInfo {
            path: path.to_path_buf(),
            total_bytes: total,
            used_bytes: used,
            free_bytes: free,
            used_percent: round2(used_percent),
            free_percent: round2(free_percent),
            is_low_space: free_percent < self.threshold_percent,
            threshold_percent: self.threshold_percent,
        })
    }

    /// `local_path` is `None` for remote destinations, whose capacity is
    /// unknown and assumed sufficient.
    pub fn check(&self, label: &str, local_path: Option<&Path>) -> SpaceCheck {
        let Some(info) = local_path.and_then(|p| self.space_info(p)) else {
            return SpaceCheck::unknown();
        };

        let warning = info.is_low_space.then(|| {
            let message = format!(
                "Low disk space on \"{}\": only {:.1}% free ({}). At least {}% free space is recommended.",
                label,
                info.free_percent,
                format_bytes(info.free_bytes),
                self.threshold_percent
            );
            warn!("{}", message);
            message
        });

        SpaceCheck {
            has_enough_space: true,
            free_percent: info.free_percent,
            free_bytes: info.free_bytes,
            warning,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FakeStats(u64, u64);

    impl FilesystemStats for FakeStats {
        fn capacity(&self, _path: &Path) -> Option<(u64, u64)> {
            Some((self.0, self.1))
        }
    }

    #[test]
    fn test_low_space_produces_warning() {
        let dir = tempdir().unwrap();
        let monitor = SpaceMonitor::with_stats(10.0, Box::new(FakeStats(1000, 50)));

        let check = monitor.check("Local (default)", Some(dir.path()));
        assert!(check.has_enough_space);
        assert_eq!(check.free_percent, 5.0);
        let warning = check.warning.unwrap();
        assert!(warning.contains("5.0% free"));
        assert!(warning.contains("Local (default)"));
    }

    #[test]
    fn test_enough_space_has_no_warning() {
        let dir = tempdir().unwrap();
        let monitor = SpaceMonitor::with_stats(10.0, Box::new(FakeStats(1000, 500)));
        let info = monitor.space_info(dir.path()).unwrap();
        assert_eq!(info.used_bytes, 500);
        assert!(!info.is_low_space);
        assert!(monitor.check("local", Some(dir.path())).warning.is_none());
    }

    #[test]
    fn test_remote_or_missing_path_is_unknown() {
        let monitor = SpaceMonitor::with_stats(10.0, Box::new(FakeStats(1000, 1)));
        assert!(monitor.check("s3", None).warning.is_none());
        let missing = monitor.check("local", Some(Path::new("/definitely/not/here")));
        assert!(missing.has_enough_space);
        assert!(missing.warning.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_real_filesystem() {
        let dir = tempdir().unwrap();
        let (total, free) = Statvfs.capacity(dir.path()).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
