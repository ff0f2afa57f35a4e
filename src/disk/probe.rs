//! Free-space probing.

use std::fmt::Debug;
use std::path::Path;

/// Source of free-space readings for a filesystem path.
pub trait SpaceProbe: Send + Sync + Debug {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the filesystem cannot be queried.
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Probe backed by `statvfs` (Unix) or `GetDiskFreeSpaceExW` (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        get_available_space(path)
    }
}

/// Queries available space for `path`.
///
/// # Errors
///
/// Returns the OS error, or `Unsupported` on platforms without an implementation.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, `stat` is zeroed
        // before the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            #[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
            Ok(u64::from(stat.f_bavail).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out-pointer refers to
        // a live, aligned u64; outputs are read only after a non-zero return.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                (&raw mut free_bytes_available).cast(),
                (&raw mut total_bytes).cast(),
                (&raw mut total_free_bytes).cast(),
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_statvfs_probe_reads_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let available = StatvfsProbe.available_bytes(dir.path()).unwrap();
        assert!(available > 0);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let result = get_available_space(Path::new("/definitely/not/a/real/path/xyz"));
        assert!(result.is_err());
    }
}
