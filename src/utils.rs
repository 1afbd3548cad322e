//! Small helpers shared by the pipelines
//!
//! Formatting for log lines and an atomic file write used by exports.

use crate::error::Result;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Format a byte count with binary units
///
/// # Example
///
/// ```rust
/// use custody::utils::format_bytes;
///
/// assert_eq!(format_bytes(12), "12 B");
/// assert_eq!(format_bytes(1536), "1.50 KiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

/// Format an elapsed time for log lines, rounded to milliseconds
pub fn format_elapsed(elapsed: Duration) -> String {
    let rounded = Duration::from_millis(elapsed.as_millis() as u64);
    humantime::format_duration(rounded).to_string()
}

/// Write a file so readers never observe it half-written
///
/// The content goes to a temporary file in the target directory, which is
/// then renamed over `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
