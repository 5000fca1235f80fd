//! Free space measurement for branch roots.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Bytes available to unprivileged writers on the filesystem holding `path`.
#[allow(clippy::unnecessary_cast)] // f_bavail/f_frsize widths differ between platforms
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    unsafe {
        let mut statvfs = MaybeUninit::<libc::statvfs>::uninit();
        if libc::statvfs(c_path.as_ptr(), statvfs.as_mut_ptr()) == 0 {
            let statvfs = statvfs.assume_init();
            Ok((statvfs.f_bavail as u64).saturating_mul(statvfs.f_frsize as u64))
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
