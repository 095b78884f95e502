//! Virtual network interface (TUN) device.
//!
//! The bonding engine only needs a [`PacketSink`] to deliver inbound
//! packets into; this module provides the Linux TUN implementation of it
//! plus the read loop feeding outbound packets into the multiplexer.
//! Other platforms get a stub that refuses to start.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Default MTU: Ethernet minus tunnel framing headroom.
pub const DEFAULT_TUN_MTU: u16 = 1460;

/// TUN device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Device name hint; empty lets the kernel pick (`tun0`, ...).
    #[serde(default)]
    pub name: String,

    /// MTU assigned to the interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Local tunnel address. Defaults by role when unset: the listening
    /// endpoint takes 10.10.10.1, the dialing endpoint 10.10.10.2.
    #[serde(default)]
    pub ipv4_addr: Option<Ipv4Addr>,

    /// Peer tunnel address; mirrors `ipv4_addr` defaulting.
    #[serde(default)]
    pub peer_addr: Option<Ipv4Addr>,
}

fn default_mtu() -> u16 {
    DEFAULT_TUN_MTU
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mtu: default_mtu(),
            ipv4_addr: None,
            peer_addr: None,
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CStr;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::process::Command;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, error, info};

    use super::TunConfig;
    use crate::bond::{Mux, PacketSink};
    use crate::error::{Error, Result};

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    /// A Linux TUN device reading and writing whole IP packets.
    pub struct TunDevice {
        io: AsyncFd<File>,
        name: String,
        mtu: u16,
    }

    impl TunDevice {
        /// Open `/dev/net/tun` and attach an interface. Requires
        /// `CAP_NET_ADMIN` or root.
        pub fn create(config: &TunConfig) -> Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")?;

            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            let name_bytes = config.name.as_bytes();
            let copy_len = name_bytes.len().min(libc::IFNAMSIZ - 1);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    name_bytes.as_ptr(),
                    ifr.ifr_name.as_mut_ptr() as *mut u8,
                    copy_len,
                );
            }
            ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

            if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) } < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }

            let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            info!(device = %name, "TUN device created");

            Ok(Self {
                io: AsyncFd::new(file)?,
                name,
                mtu: config.mtu,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn mtu(&self) -> u16 {
            self.mtu
        }

        /// Assign the point-to-point addresses, set the MTU and bring the
        /// interface up.
        pub fn configure(&self, local: Ipv4Addr, peer: Ipv4Addr) -> Result<()> {
            run_ip(&[
                "addr",
                "add",
                &local.to_string(),
                "peer",
                &format!("{peer}/32"),
                "dev",
                &self.name,
            ])?;
            run_ip(&["link", "set", "dev", &self.name, "mtu", &self.mtu.to_string()])?;
            run_ip(&["link", "set", "dev", &self.name, "up"])
        }

        /// Read one IP packet off the device.
        pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.io.readable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        /// Write one IP packet to the device.
        pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.io.writable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            buf.as_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        /// Feed every packet the system routes into the tunnel to the
        /// multiplexer, until the device goes away. Packets that cannot be
        /// carried right now (no links yet) are dropped; IP traffic is
        /// loss-tolerant by contract.
        pub async fn run(self: Arc<Self>, mux: Arc<Mux>) {
            let mut buf = vec![0u8; usize::from(self.mtu) + 64];
            loop {
                match self.recv(&mut buf).await {
                    Ok(n) => {
                        if let Err(e) = mux.send(&buf[..n]).await {
                            debug!(error = %e, "dropping outbound packet");
                        }
                    }
                    Err(e) => {
                        error!(device = %self.name, error = %e, "TUN read failed, stopping");
                        return;
                    }
                }
            }
        }
    }

    #[async_trait]
    impl PacketSink for TunDevice {
        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            self.write(packet).await.map(|_| ())
        }
    }

    fn run_ip(args: &[&str]) -> Result<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| Error::Config(format!("failed to run ip: {e}")))?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::TunConfig;
    use crate::bond::{Mux, PacketSink};
    use crate::error::{Error, Result};

    /// Placeholder for platforms without TUN support.
    pub struct TunDevice;

    impl TunDevice {
        pub fn create(_config: &TunConfig) -> Result<Self> {
            Err(Error::Config(
                "TUN devices are only supported on Linux".into(),
            ))
        }

        pub fn name(&self) -> &str {
            ""
        }

        pub fn mtu(&self) -> u16 {
            0
        }

        pub fn configure(&self, _local: Ipv4Addr, _peer: Ipv4Addr) -> Result<()> {
            Ok(())
        }

        pub async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub async fn write(&self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub async fn run(self: Arc<Self>, _mux: Arc<Mux>) {}
    }

    #[async_trait]
    impl PacketSink for TunDevice {
        async fn send(&self, _packet: &[u8]) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::TunDevice;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = TunConfig::default();
        assert_eq!(config.mtu, DEFAULT_TUN_MTU);
        assert!(config.name.is_empty());
        assert!(config.ipv4_addr.is_none());
    }
}
