//! Conversions between [`SocketAddr`] and C socket addresses.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use libc::{sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, AF_INET, AF_INET6};

pub(super) fn to_sockaddr(addr: SocketAddr) -> sockaddr_storage {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for any address.
            let sin = unsafe { &mut *(&mut storage as *mut sockaddr_storage).cast::<sockaddr_in>() };
            sin.sin_family = AF_INET as sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            // SAFETY: same as above.
            let sin6 =
                unsafe { &mut *(&mut storage as *mut sockaddr_storage).cast::<sockaddr_in6>() };
            sin6.sin6_family = AF_INET6 as sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_flowinfo = addr.flowinfo();
            sin6.sin6_addr.s6_addr = addr.ip().octets();
            sin6.sin6_scope_id = addr.scope_id();
        }
    }
    storage
}

/// Read a C socket address. Returns `None` for null pointers and families
/// other than IPv4 and IPv6.
///
/// # Safety
///
/// `sa` must be null or point to a socket address as large as its family
/// says.
pub(super) unsafe fn from_sockaddr(sa: *const sockaddr) -> Option<SocketAddr> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as i32 {
        AF_INET => {
            let sin = &*sa.cast::<sockaddr_in>();
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)).into())
        }
        AF_INET6 => {
            let sin6 = &*sa.cast::<sockaddr_in6>();
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(
                SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )
                .into(),
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        for addr in ["127.0.0.1:20079", "[fe80::1%2]:4791"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let storage = to_sockaddr(addr);
            let back = unsafe { from_sockaddr((&storage as *const sockaddr_storage).cast()) };
            assert_eq!(back, Some(addr));
        }
        assert_eq!(unsafe { from_sockaddr(std::ptr::null()) }, None);
    }
}
