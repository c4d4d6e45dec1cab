//! Multi-queue TUN device carrying the overlay's IP traffic.
//!
//! Each queue is a separate fd on the same interface; the kernel spreads
//! flows across them, so every worker pair gets its own.

use nix::libc;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace};

use super::Device;
use crate::payload::{MTU, PACKET_START, Payload};

/// Default interface name
pub const DEFAULT_NAME: &str = "meshd0";

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// How long a read waits before rechecking for shutdown, in milliseconds
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TUN device name too long",
            ));
        }
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Layer 3 TUN device with one fd per queue
pub struct TunDevice {
    name: String,
    queues: Vec<File>,
    closed: AtomicBool,
}

impl TunDevice {
    /// Create (or attach to) the interface `name` with `queues` queues.
    ///
    /// Packets are raw IP, without the packet information header.
    pub fn open(name: &str, queues: usize) -> io::Result<Self> {
        let mut name = name.to_string();
        let mut files = Vec::with_capacity(queues.max(1));

        for _ in 0..queues.max(1) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/net/tun")?;

            let mut ifr = IfReq::new(&name, IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE)?;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            // the kernel fills in the name when a pattern like "tun%d" was given
            name = ifr.name();
            files.push(file);
        }

        info!(device = %name, queues = files.len(), "TUN device opened");
        Ok(Self {
            name,
            queues: files,
            closed: AtomicBool::new(false),
        })
    }

    /// Assign the overlay address and bring the link up.
    ///
    /// The connected route for the overlay network comes with the address.
    pub fn configure(&self, address: Ipv4Addr, prefix_len: u8, mtu: usize) -> io::Result<()> {
        self.add_address(address, prefix_len)?;
        run_ip(&[
            "link",
            "set",
            "dev",
            &self.name,
            "mtu",
            &mtu.to_string(),
            "up",
        ])?;
        debug!(device = %self.name, %address, prefix_len, mtu, "TUN device configured");
        Ok(())
    }

    /// Accept traffic for `address` as well, e.g. a floating IP.
    pub fn add_address(&self, address: Ipv4Addr, prefix_len: u8) -> io::Result<()> {
        run_ip(&[
            "addr",
            "add",
            &format!("{address}/{prefix_len}"),
            "dev",
            &self.name,
        ])
    }

    /// Wait until `fd` is readable, the timeout expires, or an error occurs.
    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }
}

impl Device for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn queues(&self) -> usize {
        self.queues.len()
    }

    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let mut file = self.queues.get(queue)?;
        if !Self::readable(file.as_raw_fd()) {
            return None;
        }

        let end = buf.len().min(PACKET_START + MTU);
        match file.read(&mut buf[PACKET_START..end]) {
            Ok(0) => None,
            Ok(n) => Payload::from_device(buf, n),
            Err(e) => {
                trace!(queue, error = %e, "TUN read failed");
                None
            }
        }
    }

    fn write(&self, queue: usize, payload: &Payload<'_>) -> bool {
        let Some(mut file) = self.queues.get(queue) else {
            return false;
        };
        match file.write(payload.packet()) {
            Ok(n) => n == payload.packet_len(),
            Err(e) => {
                trace!(queue, error = %e, "TUN write failed");
                false
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Run `ip <args>`, tolerating "File exists" for idempotent setup.
fn run_ip(args: &[&str]) -> io::Result<()> {
    let output = Command::new("ip").args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("File exists") {
            return Err(io::Error::other(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
    }

    Ok(())
}
