//! Reference `PortDriver`: one `AF_PACKET` raw socket per attached port.
//!
//! This stands in for a real poll-mode driver (DPDK, or similar) so the
//! engine has something concrete to run against without depending on a
//! binding crate this codebase's ecosystem doesn't carry. Each "port" is
//! a network interface name; queues are not physically separate (a raw
//! socket has one rx/tx path), so `queue` is accepted but ignored beyond
//! being part of the trait's shape.
//!
//! Socket setup goes through raw `libc` calls; only the non-blocking
//! toggle reuses `nix::fcntl`.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;

use super::{PortDriver, PortId};
use crate::error::{RelayError, Result};
use crate::mempool::{Mempool, Packet};

struct PortHandle {
    fd: OwnedFd,
    running: AtomicBool,
}

pub struct SoftPortDriver {
    next_id: AtomicU32,
    ports: Mutex<HashMap<PortId, PortHandle>>,
}

impl Default for SoftPortDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftPortDriver {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn ifindex(name: &str) -> Result<libc::c_uint> {
        let cname = std::ffi::CString::new(name)
            .map_err(|e| RelayError::InvalidArg(format!("interface name: {e}")))?;
        let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if idx == 0 {
            return Err(RelayError::BackendFail(format!(
                "no such interface: {name}"
            )));
        }
        Ok(idx)
    }

    /// Open and bind a non-blocking `AF_PACKET`/`SOCK_RAW` socket to `name`.
    fn open_raw_socket(name: &str) -> Result<OwnedFd> {
        let ifindex = Self::ifindex(name)?;

        let raw_fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if raw_fd < 0 {
            return Err(RelayError::BackendFail(format!(
                "socket(AF_PACKET) for {name}: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = ifindex as i32;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            return Err(RelayError::BackendFail(format!(
                "bind to {name}: {}",
                std::io::Error::last_os_error()
            )));
        }

        let borrowed: BorrowedFd = fd.as_fd();
        let flags = fcntl(borrowed, FcntlArg::F_GETFL)
            .map_err(|e| RelayError::BackendFail(format!("fcntl(F_GETFL): {e}")))?;
        let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(borrowed, FcntlArg::F_SETFL(new_flags))
            .map_err(|e| RelayError::BackendFail(format!("fcntl(F_SETFL): {e}")))?;

        Ok(fd)
    }
}

impl PortDriver for SoftPortDriver {
    fn attach(&self, name: &str) -> Result<PortId> {
        let fd = Self::open_raw_socket(name)?;
        let id = PortId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.ports.lock().unwrap().insert(
            id,
            PortHandle {
                fd,
                running: AtomicBool::new(false),
            },
        );
        Ok(id)
    }

    fn detach(&self, port: PortId) {
        self.ports.lock().unwrap().remove(&port);
    }

    fn configure_queues(&self, _port: PortId, _mempool: &Mempool) -> Result<()> {
        // A raw socket has no separate queue/mempool configuration step;
        // buffers are sized per-call from whichever mempool the caller
        // passes to rx_burst.
        Ok(())
    }

    fn start(&self, port: PortId) -> Result<()> {
        let ports = self.ports.lock().unwrap();
        let handle = ports
            .get(&port)
            .ok_or_else(|| RelayError::InvalidArg(format!("unknown port {port:?}")))?;
        handle.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self, port: PortId) -> Result<()> {
        let ports = self.ports.lock().unwrap();
        let handle = ports
            .get(&port)
            .ok_or_else(|| RelayError::InvalidArg(format!("unknown port {port:?}")))?;
        handle.running.store(false, Ordering::Release);
        Ok(())
    }

    fn rx_burst(&self, port: PortId, _queue: u16, max: usize, mempool: &Mempool) -> Vec<Packet> {
        let ports = self.ports.lock().unwrap();
        let Some(handle) = ports.get(&port) else {
            return Vec::new();
        };
        if !handle.running.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(max.min(32));
        let mut scratch = vec![0u8; mempool.buffer_size()];
        for _ in 0..max {
            let n = unsafe {
                libc::recv(
                    handle.fd.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n <= 0 {
                break;
            }
            out.push(Packet::from_bytes(mempool, &scratch[..n as usize]));
        }
        out
    }

    fn tx_burst(&self, port: PortId, _queue: u16, pkts: &mut Vec<Packet>) -> (usize, u64) {
        let ports = self.ports.lock().unwrap();
        let Some(handle) = ports.get(&port) else {
            return (0, 0);
        };
        if !handle.running.load(Ordering::Acquire) {
            return (0, 0);
        }

        let mut sent = 0usize;
        let mut bytes = 0u64;
        while !pkts.is_empty() {
            let data = pkts[0].as_slice();
            let n = unsafe {
                libc::send(
                    handle.fd.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                break;
            }
            bytes += n as u64;
            sent += 1;
            pkts.remove(0);
        }
        (sent, bytes)
    }
}
