//! Free-space query for the volume holding the data directory.

use std::path::Path;

use crate::FREE_BYTES_UNKNOWN;

/// Free bytes available on the filesystem containing `path`, or
/// [`FREE_BYTES_UNKNOWN`] when the platform cannot report it. Callers treat
/// the sentinel as "assume there is room".
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return FREE_BYTES_UNKNOWN;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return FREE_BYTES_UNKNOWN;
    }
    (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> u64 {
    FREE_BYTES_UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_reports_free_space_for_tmp() {
        let free = free_bytes(Path::new("/tmp"));
        assert_ne!(free, FREE_BYTES_UNKNOWN);
    }

    #[test]
    fn test_unknown_for_missing_path() {
        // statvfs fails on a path that does not exist.
        let free = free_bytes(Path::new("/definitely/not/a/real/path"));
        #[cfg(unix)]
        assert_eq!(free, FREE_BYTES_UNKNOWN);
        #[cfg(not(unix))]
        assert_eq!(free, FREE_BYTES_UNKNOWN);
    }
}
