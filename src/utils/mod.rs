//! Small filesystem and formatting helpers shared across modules.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Create a directory and its parents if missing
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Resolve a program name against PATH, the way the shell would.
/// Names containing a path separator are checked as-is.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

/// Disk space statistics for the filesystem holding a path
#[derive(Debug, Clone)]
pub struct DiskStats {
    /// Total disk space in bytes
    pub total_bytes: u64,
    /// Used disk space in bytes
    pub used_bytes: u64,
    /// Free disk space in bytes
    pub free_bytes: u64,
    /// Percentage of disk space used (0-100)
    pub usage_percent: f64,
}

impl DiskStats {
    pub fn for_path(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::ffi::CString;
            use std::mem::MaybeUninit;
            use std::os::unix::ffi::OsStrExt;

            let c_path = CString::new(path.as_os_str().as_bytes())?;
            let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();

            let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
            if result != 0 {
                return Err(anyhow::anyhow!(
                    "Failed to get disk stats for {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                ));
            }

            let stat = unsafe { stat.assume_init() };

            let block_size = stat.f_frsize as u64;
            let total_bytes = stat.f_blocks as u64 * block_size;
            let free_bytes = stat.f_bfree as u64 * block_size;
            let available_bytes = stat.f_bavail as u64 * block_size;
            let used_bytes = total_bytes - free_bytes;

            // Available bytes account for reserved blocks
            let usage_percent = if total_bytes > 0 {
                ((total_bytes - available_bytes) as f64 / total_bytes as f64) * 100.0
            } else {
                0.0
            };

            Ok(Self {
                total_bytes,
                used_bytes,
                free_bytes,
                usage_percent,
            })
        }

        #[cfg(not(unix))]
        {
            Err(anyhow::anyhow!(
                "Disk stats not supported on this platform ({})",
                path.display()
            ))
        }
    }
}

/// Format a byte count as a human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Format a duration in seconds as h/m/s
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent
        ensure_dir(&nested).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_resolve_program_finds_sh() {
        assert!(resolve_program("sh").is_some());
    }

    #[test]
    fn test_resolve_program_rejects_missing() {
        assert!(resolve_program("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_resolve_program_with_separator_checks_file() {
        assert!(resolve_program("/bin/sh").is_some());
        assert!(resolve_program("/bin/definitely-not-here").is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_disk_stats_for_root() {
        let stats = DiskStats::for_path(Path::new("/")).unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.usage_percent >= 0.0 && stats.usage_percent <= 100.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3700), "1h 1m");
    }
}
