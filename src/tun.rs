//! Virtual interface management
//!
//! Creates a Linux TUN device (no packet-info header), assigns it the
//! tunnel address and installs the routes that steer traffic into it.
//! The descriptor is owned by a `File` inside tokio's `AsyncFd`, so dropping
//! the [`TunDevice`] on any path closes it and the kernel removes the
//! interface together with its routes.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::process::Command;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::config::{parse_cidr, InterfaceConfig};
use crate::engine::PacketDevice;
use crate::error::{Error, Result};

const TUN_CONTROL: &str = "/dev/net/tun";

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Longest interface name the kernel accepts
pub const MAX_NAME_LEN: usize = 15;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// An open TUN interface
pub struct TunDevice {
    fd: AsyncFd<std::fs::File>,
    name: String,
}

impl TunDevice {
    /// Open the control device and bind a TUN interface named `name`.
    /// Must be called from within a tokio runtime.
    pub fn create(name: &str) -> Result<Self> {
        validate_name(name)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_CONTROL)
            .map_err(|e| Error::DeviceUnavailable(format!("cannot open {}: {}", TUN_CONTROL, e)))?;

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        // SAFETY: fd is open for the lifetime of `file`, req is a valid ifreq
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut Ifreq) };
        if ret < 0 {
            // `file` is dropped here, closing the descriptor
            return Err(Error::DeviceUnavailable(format!(
                "TUNSETIFF {} failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        let fd = AsyncFd::new(file)
            .map_err(|e| Error::DeviceUnavailable(format!("cannot register {}: {}", actual_name, e)))?;

        debug!("Opened TUN device {}", actual_name);
        Ok(Self { fd, name: actual_name })
    }

    /// Assign address, bring the link up and install routes
    pub fn configure(&self, config: &InterfaceConfig) -> Result<()> {
        for step in configure_steps(&self.name, config)? {
            let output = Command::new("ip")
                .args(&step.args)
                .output()
                .map_err(|e| Error::InterfaceConfig(format!("cannot run ip: {}", e)))?;

            if output.status.success() {
                continue;
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            if step.required {
                return Err(Error::InterfaceConfig(format!(
                    "ip {} failed: {}",
                    step.args.join(" "),
                    stderr.trim()
                )));
            }
            warn!("ip {} failed: {}", step.args.join(" "), stderr.trim());
        }

        info!(
            "Interface {} up with {}/{}",
            self.name, config.address, config.prefix_len
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet, waiting until one is available
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one packet
    pub async fn write(&self, packet: &[u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf).await
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.write(packet).await
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!("Releasing TUN device {}", self.name);
    }
}

/// Create and configure the interface described by `config`. On error the
/// descriptor is already closed when this returns.
pub fn acquire(config: &InterfaceConfig) -> Result<TunDevice> {
    let device = TunDevice::create(&config.name)?;
    device.configure(config)?;
    Ok(device)
}

/// One `ip` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    args: Vec<String>,
    required: bool,
}

impl Step {
    fn required(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            required: true,
        }
    }

    fn optional(args: &[&str]) -> Self {
        Self {
            required: false,
            ..Self::required(args)
        }
    }
}

fn configure_steps(name: &str, config: &InterfaceConfig) -> Result<Vec<Step>> {
    let (subnet, subnet_len) =
        parse_cidr(&config.peer_subnet).map_err(|e| Error::InterfaceConfig(e.to_string()))?;
    let local = format!("{}/{}", config.address, config.prefix_len);
    let broadcast = config.broadcast.to_string();
    let mtu = config.mtu.to_string();
    let peer_route = format!("{}/{}", subnet, subnet_len);
    let gateway = config.gateway.to_string();

    let mut steps = vec![
        Step::required(&["addr", "add", &local, "broadcast", &broadcast, "dev", name]),
        Step::optional(&["link", "set", "dev", name, "mtu", &mtu]),
        Step::required(&["link", "set", "dev", name, "up"]),
        Step::required(&["route", "replace", &peer_route, "dev", name]),
    ];
    if config.default_route {
        steps.push(Step::required(&[
            "route", "replace", "default", "via", &gateway, "dev", name,
        ]));
    }
    Ok(steps)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains(|c: char| c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::DeviceUnavailable(format!(
            "invalid interface name '{}'",
            name
        )));
    }
    Ok(())
}
