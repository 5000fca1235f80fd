//! Low-level extended attribute reads
//!
//! Thin wrapper over the platform `getxattr` family. Symlinks are never
//! followed. A missing attribute is a normal outcome and yields `Ok(None)`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Read the raw value of attribute `name` on `path`.
pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let c_name =
        CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    loop {
        let len = match raw_get(&c_path, &c_name, &mut [])? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len];
        match raw_get(&c_path, &c_name, &mut buf) {
            Ok(Some(n)) => {
                buf.truncate(n);
                return Ok(Some(buf));
            }
            Ok(None) => return Ok(None),
            // Value grew between the size probe and the read
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read attribute `name` on `path` as a UTF-8 string (lossy).
pub fn get_string(path: &Path, name: &str) -> io::Result<Option<String>> {
    Ok(get(path, name)?.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
}

fn raw_get(path: &CString, name: &CString, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let ret = unsafe { sys_getxattr(path, name, buf) };
    if ret >= 0 {
        return Ok(Some(ret as usize));
    }
    let err = io::Error::last_os_error();
    if is_absent(&err) {
        Ok(None)
    } else {
        Err(err)
    }
}

fn is_absent(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == ENOATTR || code == libc::ENOTSUP,
        None => false,
    }
}

#[cfg(target_os = "linux")]
const ENOATTR: i32 = libc::ENODATA;

#[cfg(not(target_os = "linux"))]
const ENOATTR: i32 = libc::ENOATTR;

#[cfg(target_os = "linux")]
unsafe fn sys_getxattr(path: &CString, name: &CString, buf: &mut [u8]) -> isize {
    libc::lgetxattr(
        path.as_ptr(),
        name.as_ptr(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
    )
}

#[cfg(target_os = "macos")]
unsafe fn sys_getxattr(path: &CString, name: &CString, buf: &mut [u8]) -> isize {
    libc::getxattr(
        path.as_ptr(),
        name.as_ptr(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        libc::XATTR_NOFOLLOW,
    )
}
