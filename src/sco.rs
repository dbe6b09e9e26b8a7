//! SCO sockets for synchronous voice links.
//!
//! Unlike A2DP, the voice socket is not handed over by the Bluetooth
//! service: the audio gateway connects it directly, with the voice setting
//! chosen for the negotiated codec before the connection is initiated.

use libc::{c_int, AF_BLUETOOTH, EAGAIN, EINPROGRESS, SOCK_SEQPACKET, SOL_SOCKET, SO_ERROR};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    os::unix::io::{AsRawFd, RawFd},
};
use tokio::io::unix::AsyncFd;

use crate::{
    codec::HfpCodec,
    sock::{self, OwnedFd},
    sys,
    transport::AcquiredLink,
    Address,
};

/// A SCO socket address: just the device address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr {
    /// Device address.
    ///
    /// When binding, specify [Address::any] for any local adapter address.
    pub addr: Address,
}

impl SocketAddr {
    /// Creates a new SCO socket address.
    pub const fn new(addr: Address) -> Self {
        Self { addr }
    }

    /// Any local adapter address.
    pub const fn any() -> Self {
        Self { addr: Address::any() }
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.addr)
    }
}

impl SocketAddr {
    /// The raw socket address structure for bind and connect.
    pub(crate) fn to_sys(self) -> sys::sockaddr_sco {
        sys::sockaddr_sco { sco_family: AF_BLUETOOTH as _, sco_bdaddr: self.addr.to_bdaddr() }
    }

    /// Interprets a raw socket address structure.
    pub(crate) fn from_sys(saddr: sys::sockaddr_sco) -> Result<Self> {
        if saddr.sco_family != AF_BLUETOOTH as libc::sa_family_t {
            return Err(Error::new(ErrorKind::InvalidInput, "sockaddr_sco::sco_family is not AF_BLUETOOTH"));
        }
        Ok(Self { addr: Address::from_bdaddr(saddr.sco_bdaddr) })
    }
}

/// A SCO socket that has not been connected yet.
///
/// The primary use is configuring the voice setting before connecting.
pub struct Socket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

impl Socket {
    /// Creates a new socket of sequential packet type.
    pub fn new() -> Result<Self> {
        Ok(Self { fd: AsyncFd::new(sock::socket(AF_BLUETOOTH, SOCK_SEQPACKET, sys::BTPROTO_SCO)?)? })
    }

    /// Bind the socket to the given local adapter address.
    pub fn bind(&self, sa: SocketAddr) -> Result<()> {
        sock::bind(self.fd.get_ref(), &sa.to_sys())
    }

    /// Sets the voice setting appropriate for the codec.
    ///
    /// Transparent data is required for anything but CVSD; the controller
    /// refuses wideband speech otherwise.
    ///
    /// This corresponds to the `BT_VOICE` socket option.
    pub fn set_voice(&self, codec: HfpCodec) -> Result<()> {
        let setting = sys::bt_voice {
            setting: if codec.is_transparent() {
                sys::BT_VOICE_TRANSPARENT
            } else {
                sys::BT_VOICE_CVSD_16BIT
            },
        };
        sock::setsockopt(self.fd.get_ref(), sys::SOL_BLUETOOTH, sys::BT_VOICE, &setting)
    }

    /// Gets the SCO link MTUs for reading and writing.
    ///
    /// Newer kernels expose them through `BT_RCVMTU`/`BT_SNDMTU`; older
    /// ones only through the symmetric `SCO_OPTIONS` MTU. Controllers
    /// reporting a bogus zero MTU fall back to the USB alternate-setting
    /// transfer size of 48 bytes.
    pub fn mtus(&self) -> Result<(u16, u16)> {
        let rcv: Result<u16> = sock::getsockopt(self.fd.get_ref(), sys::SOL_BLUETOOTH, sys::BT_RCVMTU);
        let snd: Result<u16> = sock::getsockopt(self.fd.get_ref(), sys::SOL_BLUETOOTH, sys::BT_SNDMTU);
        if let (Ok(rcv), Ok(snd)) = (rcv, snd) {
            if rcv > 0 && snd > 0 {
                return Ok((rcv, snd));
            }
        }
        let opts: sys::sco_options = sock::getsockopt(self.fd.get_ref(), sys::SOL_SCO, sys::SCO_OPTIONS)?;
        let mtu = if opts.mtu == 0 { 48 } else { opts.mtu };
        Ok((mtu, mtu))
    }

    /// Establish a connection with the peer at the specified address.
    pub async fn connect(self, sa: SocketAddr) -> Result<Self> {
        match sock::connect(self.fd.get_ref(), &sa.to_sys()) {
            Ok(()) => Ok(self),
            Err(err) if err.raw_os_error() == Some(EINPROGRESS) || err.raw_os_error() == Some(EAGAIN) => {
                loop {
                    let mut guard = self.fd.writable().await?;
                    match guard.try_io(|inner| {
                        let err: c_int = sock::getsockopt(inner.get_ref(), SOL_SOCKET, SO_ERROR)?;
                        match err {
                            0 => Ok(()),
                            EINPROGRESS | EAGAIN => Err(ErrorKind::WouldBlock.into()),
                            _ => Err(Error::from_raw_os_error(err)),
                        }
                    }) {
                        Ok(result) => break result,
                        Err(_would_block) => continue,
                    }
                }?;
                Ok(self)
            }
            Err(err) => Err(err),
        }
    }

    /// Consumes the socket, returning the owned descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd.into_inner()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Connects a voice link to `peer` with the codec-appropriate voice
/// setting and returns it ready for transport acquisition.
///
/// SCO payloads are symmetric; the link MTU serves both directions.
pub async fn connect(local: Address, peer: Address, codec: HfpCodec) -> crate::Result<AcquiredLink> {
    let socket = Socket::new().map_err(crate::Error::from)?;
    socket.bind(SocketAddr::new(local)).map_err(crate::Error::from)?;
    socket.set_voice(codec).map_err(crate::Error::from)?;
    let socket = socket.connect(SocketAddr::new(peer)).await.map_err(crate::Error::from)?;
    let (mtu_read, mtu_write) = socket.mtus().map_err(crate::Error::from)?;
    log::debug!("Connected SCO to {peer} with {codec} (MTU {mtu_read}/{mtu_write})");
    Ok(AcquiredLink { fd: socket.into_owned_fd(), mtu_read, mtu_write })
}

/// Local controller features relevant to voice links.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AdapterFeatures {
    /// Transparent eSCO supported, making mSBC eligible.
    pub msbc_capable: bool,
}

/// Reads the LMP feature mask of a local controller.
pub fn adapter_features(dev_id: u16) -> crate::Result<AdapterFeatures> {
    let fd = sock::socket(AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI).map_err(crate::Error::from)?;
    let mut info: sys::hci_dev_info = unsafe { std::mem::zeroed() };
    info.dev_id = dev_id;
    unsafe { sys::hci_get_dev_info(fd.as_raw_fd(), &mut info) }
        .map_err(|err| crate::Error::from(std::io::Error::from(err)))?;

    // wideband speech needs both eSCO and transparent SCO data
    let esco = info.features[3] & sys::LMP_ESCO != 0;
    let transparent = info.features[2] & sys::LMP_TRSP_SCO != 0;
    Ok(AdapterFeatures { msbc_capable: esco && transparent })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_conversion() {
        let addr = Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03]);
        let sa = SocketAddr::new(addr);
        let sys_sa = sa.to_sys();
        assert_eq!(sys_sa.sco_family, AF_BLUETOOTH as u16);
        // bdaddr_t is little-endian over the wire
        assert_eq!(sys_sa.sco_bdaddr.b, [0x03, 0x32, 0x07, 0xDC, 0x1B, 0x00]);
        assert_eq!(SocketAddr::from_sys(sys_sa).unwrap(), sa);
    }

    #[test]
    fn voice_setting_follows_codec() {
        assert!(!HfpCodec::Cvsd.is_transparent());
        assert!(HfpCodec::Msbc.is_transparent());
        assert!(HfpCodec::Lc3Swb.is_transparent());
    }
}
