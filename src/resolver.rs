//! Reverse-DNS lookup of client addresses.
//!
//! Lookup is best-effort: a failure falls back to the raw IP string and is
//! never grounds for dropping the connection.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, SocketAddr};

/// Maps a client IP to a readable host name.
pub trait HostnameResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> io::Result<String>;
}

/// Resolver backed by the system's `getnameinfo`.
pub struct SystemResolver;

impl HostnameResolver for SystemResolver {
    fn resolve(&self, ip: IpAddr) -> io::Result<String> {
        let addr: socket2::SockAddr = SocketAddr::new(ip, 0).into();
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];

        // NI_NAMEREQD: an address without a PTR record is an error, not an
        // echo of the numeric form.
        let rc = unsafe {
            libc::getnameinfo(
                addr.as_ptr(),
                addr.len(),
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("reverse lookup failed for {ip}"),
            ));
        }

        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }
}
