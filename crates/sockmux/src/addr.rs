//! Socket endpoint addresses.
//!
//! An [`Address`] is an immutable value wrapping a `sockaddr_storage` plus
//! its length. Resolution wraps `getaddrinfo` as a black box and always
//! produces a finite, ordered, already-materialized list — a name that does
//! not exist yields an empty list, not an error.

use std::ffi::CString;
use std::fmt;
use std::mem;
use std::ptr;

use sockmux_core::{MuxError, MuxResult};

// `inet_ntop` / `INET6_ADDRSTRLEN` are not exported by the `libc` crate on
// Linux; bind the libc symbol directly.
const INET6_ADDRSTRLEN: libc::c_int = 46;

extern "C" {
    fn inet_ntop(
        af: libc::c_int,
        src: *const libc::c_void,
        dst: *mut libc::c_char,
        size: libc::socklen_t,
    ) -> *const libc::c_char;
}

/// One socket endpoint: family + protocol-specific bytes + length.
#[derive(Clone, Copy)]
pub struct Address {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Address {
    /// Wildcard address for the given family (`AF_INET` / `AF_INET6`).
    pub fn any(port: u16, family: i32) -> MuxResult<Self> {
        match family {
            libc::AF_INET => Ok(Self::v4([0, 0, 0, 0], port)),
            libc::AF_INET6 => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = port.to_be();
                Ok(unsafe {
                    Self::from_raw(
                        &sin6 as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                })
            }
            _ => Err(MuxError::InvalidArgument),
        }
    }

    /// IPv4 endpoint from octets + port.
    pub fn v4(octets: [u8; 4], port: u16) -> Self {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = port.to_be();
        sin.sin_addr = libc::in_addr {
            s_addr: u32::from_be_bytes(octets).to_be(),
        };
        unsafe {
            Self::from_raw(
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
    }

    /// Copy `len` bytes of a native sockaddr.
    ///
    /// # Safety
    /// `sa` must point at a valid sockaddr of at least `len` bytes, and
    /// `len` must not exceed `sizeof(sockaddr_storage)`.
    pub unsafe fn from_raw(sa: *const libc::sockaddr, len: libc::socklen_t) -> Self {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        ptr::copy_nonoverlapping(
            sa as *const u8,
            &mut storage as *mut _ as *mut u8,
            (len as usize).min(mem::size_of::<libc::sockaddr_storage>()),
        );
        Self { storage, len }
    }

    pub(crate) fn from_storage(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Self {
        Self { storage, len }
    }

    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    pub fn port(&self) -> u16 {
        match self.family() {
            libc::AF_INET => {
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                u16::from_be(sin.sin_port)
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                u16::from_be(sin6.sin6_port)
            }
            _ => 0,
        }
    }

    pub(crate) fn as_sockaddr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolve `host:port` into an ordered, finite list of candidate
    /// addresses. `family` restricts the result (`AF_UNSPEC` allows both).
    /// A non-existent name resolves to an empty list.
    pub fn resolve(host: &str, port: u16, family: i32) -> MuxResult<Vec<Address>> {
        let chost = CString::new(host).map_err(|_| MuxError::InvalidArgument)?;
        let cport = CString::new(port.to_string()).map_err(|_| MuxError::InvalidArgument)?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = family;
        // One entry per distinct address rather than one per protocol.
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(chost.as_ptr(), cport.as_ptr(), &hints, &mut res) };
        if rc != 0 {
            return match rc {
                libc::EAI_NONAME | libc::EAI_AGAIN => Ok(Vec::new()),
                _ => Err(MuxError::InvalidArgument),
            };
        }

        let mut out = Vec::new();
        let mut cur = res;
        while !cur.is_null() {
            let ai = unsafe { &*cur };
            if !ai.ai_addr.is_null() && ai.ai_addrlen > 0 {
                out.push(unsafe { Self::from_raw(ai.ai_addr, ai.ai_addrlen) });
            }
            cur = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(res) };
        Ok(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = [0 as libc::c_char; INET6_ADDRSTRLEN as usize];
        match self.family() {
            libc::AF_INET => {
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let p = unsafe {
                    inet_ntop(
                        libc::AF_INET,
                        &sin.sin_addr as *const _ as *const libc::c_void,
                        text.as_mut_ptr(),
                        text.len() as libc::socklen_t,
                    )
                };
                if p.is_null() {
                    return write!(f, "<invalid v4>");
                }
                let ip = unsafe { std::ffi::CStr::from_ptr(text.as_ptr()) };
                write!(f, "{}:{}", ip.to_string_lossy(), self.port())
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                let p = unsafe {
                    inet_ntop(
                        libc::AF_INET6,
                        &sin6.sin6_addr as *const _ as *const libc::c_void,
                        text.as_mut_ptr(),
                        text.len() as libc::socklen_t,
                    )
                };
                if p.is_null() {
                    return write!(f, "<invalid v6>");
                }
                let ip = unsafe { std::ffi::CStr::from_ptr(text.as_ptr()) };
                write!(f, "[{}]:{}", ip.to_string_lossy(), self.port())
            }
            fam => write!(f, "<family {}>", fam),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_roundtrip() {
        let addr = Address::v4([127, 0, 0, 1], 7543);
        assert_eq!(addr.family(), libc::AF_INET);
        assert_eq!(addr.port(), 7543);
        assert_eq!(addr.to_string(), "127.0.0.1:7543");
    }

    #[test]
    fn test_any() {
        let addr = Address::any(80, libc::AF_INET).unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:80");
        assert!(Address::any(80, 12345).is_err());
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = Address::resolve("localhost", 80, libc::AF_INET).unwrap();
        assert!(!addrs.is_empty());
        for a in &addrs {
            assert_eq!(a.family(), libc::AF_INET);
            assert_eq!(a.port(), 80);
        }
    }

    #[test]
    fn test_resolve_nonexistent_is_empty() {
        let addrs = Address::resolve("example.invalid", 80, libc::AF_INET).unwrap();
        assert!(addrs.is_empty());
    }
}
