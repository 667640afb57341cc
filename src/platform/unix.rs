//! Interface enumeration on Unix-like systems via `getifaddrs(3)`

use super::NetworkInterface;
use crate::error::{Result, WatchError};
use std::ffi::CStr;

/// Enumerate interfaces, one entry per name in first-seen order
///
/// `getifaddrs` yields one record per address, so names repeat; an interface
/// counts as up if any of its records carries `IFF_UP`.
pub fn interfaces() -> Result<Vec<NetworkInterface>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: `head` is a valid out-pointer; on success it owns a list that
    // is released with `freeifaddrs` below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(WatchError::Enumeration(format!(
            "getifaddrs failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut result: Vec<NetworkInterface> = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a non-null node of the list returned above.
        let entry = unsafe { &*cursor };
        if !entry.ifa_name.is_null() {
            // SAFETY: `ifa_name` is a NUL-terminated string owned by the list.
            let name = unsafe { CStr::from_ptr(entry.ifa_name) }
                .to_string_lossy()
                .into_owned();
            let is_up = entry.ifa_flags & (libc::IFF_UP as libc::c_uint) != 0;

            merge(&mut result, name, is_up);
        }
        cursor = entry.ifa_next;
    }

    // SAFETY: `head` came from a successful `getifaddrs` and is freed once.
    unsafe { libc::freeifaddrs(head) };

    Ok(result)
}

fn merge(interfaces: &mut Vec<NetworkInterface>, name: String, is_up: bool) {
    match interfaces.iter_mut().find(|i| i.name == name) {
        Some(existing) => existing.is_up |= is_up,
        None => interfaces.push(NetworkInterface { name, is_up }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_first_seen_order() {
        let mut list = Vec::new();
        merge(&mut list, "en0".into(), false);
        merge(&mut list, "utun4".into(), true);
        merge(&mut list, "en0".into(), true);
        assert_eq!(
            list,
            vec![
                NetworkInterface::new("en0", true),
                NetworkInterface::new("utun4", true)
            ]
        );
    }

    #[test]
    fn test_enumeration_has_unique_names() {
        let list = interfaces().expect("getifaddrs should succeed");
        let mut names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
