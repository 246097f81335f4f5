use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::table::SockKey;

/// Per-datagram metadata recovered from the receive path. `dst` is the IP
/// the sender addressed — for multicast that is the group, not the local
/// interface — and `if_index` is the arrival interface. Both are required to
/// demultiplex the same group joined on several interfaces of a multi-homed
/// host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DgramMeta {
    pub len: usize,
    pub src: SocketAddrV4,
    pub dst: Ipv4Addr,
    pub if_index: u32,
}

/// One non-blocking UDP socket with destination-address recovery enabled.
pub struct UdpEndpoint {
    sock: mio::net::UdpSocket,
}

impl UdpEndpoint {
    /// Open, configure and bind per the table key. QoS maps to the TOS
    /// precedence bits, TTL applies to both unicast and multicast sends.
    pub fn open(key: &SockKey) -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.set_reuse_address(true)?;
        if key.qos > 0 {
            sock.set_tos((key.qos as u32) << 5)?;
        }
        if key.ttl > 0 {
            sock.set_ttl(key.ttl as u32)?;
            sock.set_multicast_ttl_v4(key.ttl as u32)?;
        }
        sock.set_multicast_loop_v4(true)?;
        enable_pktinfo(&sock)?;
        sock.bind(&SocketAddrV4::new(key.bind_ip, key.port).into())?;
        debug!(?key, "udp endpoint open");

        Ok(Self { sock: mio::net::UdpSocket::from_std(sock.into()) })
    }

    pub fn mio(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.sock
    }

    pub fn send_to(&self, frame: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        self.sock.send_to(frame, SocketAddr::V4(dst))
    }

    pub fn join(&self, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
        socket_ref(&self.sock).join_multicast_v4(&group, &iface)
    }

    pub fn leave(&self, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
        socket_ref(&self.sock).leave_multicast_v4(&group, &iface)
    }

    /// Read one datagram with its destination metadata. `Ok(None)` when the
    /// socket has drained (would block).
    pub fn recv_with_dst(&self, buf: &mut [u8]) -> io::Result<Option<DgramMeta>> {
        recv_with_dst_impl(&self.sock, buf)
    }
}

/// Borrow the raw fd as a socket2 handle without taking ownership.
fn socket_ref(sock: &mio::net::UdpSocket) -> socket2::SockRef<'_> {
    socket2::SockRef::from(sock)
}

/// Resolve the kernel interface index for a locally configured address.
/// Needed to pin a subscriber to the interface its group was joined on.
#[cfg(target_os = "linux")]
pub fn iface_index_for_ip(ip: Ipv4Addr) -> Option<u32> {
    use std::ffi::CStr;

    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs allocates the list we free below; every node is
    // walked read-only.
    unsafe {
        if libc::getifaddrs(&mut addrs) != 0 {
            return None;
        }
        let mut found = None;
        let mut current = addrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() &&
                (*ifa.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
            {
                let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                if Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)) == ip {
                    let name = CStr::from_ptr(ifa.ifa_name);
                    let index = libc::if_nametoindex(name.as_ptr());
                    if index != 0 {
                        found = Some(index);
                        break;
                    }
                }
            }
            current = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
        found
    }
}

#[cfg(not(target_os = "linux"))]
pub fn iface_index_for_ip(_ip: Ipv4Addr) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn enable_pktinfo(sock: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_sock: &Socket) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn recv_with_dst_impl(
    sock: &mio::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<DgramMeta>> {
    use std::os::fd::AsRawFd;

    // cmsghdr + in_pktinfo with alignment headroom.
    const CMSG_CAP: usize = 64;

    let mut src_storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_CAP];
    let mut iov =
        libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
    hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = CMSG_CAP;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut hdr, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    let src = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(src_storage.sin_addr.s_addr)),
        u16::from_be(src_storage.sin_port),
    );

    let mut dst = Ipv4Addr::UNSPECIFIED;
    let mut if_index = 0u32;
    // SAFETY: the CMSG_* macros walk the control buffer we own, bounded by
    // msg_controllen which the kernel set.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&hdr) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_PKTINFO {
            let info: libc::in_pktinfo =
                unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _) };
            dst = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
            if_index = info.ipi_ifindex as u32;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&hdr, cmsg) };
    }

    Ok(Some(DgramMeta { len: n as usize, src, dst, if_index }))
}

#[cfg(not(target_os = "linux"))]
fn recv_with_dst_impl(
    sock: &mio::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<DgramMeta>> {
    match sock.recv_from(buf) {
        Ok((len, SocketAddr::V4(src))) => {
            Ok(Some(DgramMeta { len, src, dst: Ipv4Addr::UNSPECIFIED, if_index: 0 }))
        }
        Ok((_, SocketAddr::V6(_))) => Ok(None),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}
