#![cfg_attr(docsrs, feature(doc_cfg))]

//! # BlueAudio — Bluetooth audio profile daemon
//!
//! This library implements a user-space bridge between Bluetooth audio and
//! MIDI profiles and local audio clients. It cooperates with the system
//! Bluetooth daemon (BlueZ) over D-Bus: local stream end-points are
//! registered with the [media manager](service::Service), remote devices
//! select a codec configuration, and the daemon moves media between the
//! Bluetooth socket and client FIFOs, applying codec framing, RTP
//! packetization, rate control and volume scaling.
//!
//! This library depends on the [tokio] asynchronous runtime.
//!
//! The following functionality is provided.
//!
//! * [A2DP capability engine](a2dp)
//!     * bit-exact capability blobs for SBC, MPEG audio, AAC, aptX,
//!       aptX HD, FastStream and optional LDAC / LC3plus
//!     * capability intersection, configuration validation and best-value
//!       selection
//! * [Transport object graph](transport)
//!     * adapter, device and transport entities in an id-indexed arena
//!     * acquire / release lifecycle with per-direction [PCM](pcm) halves
//! * [Streaming workers](worker)
//!     * encoder and decoder loops with [RTP state tracking](rtp),
//!       [rate synchronization](asrsync) and MTU-aware fragmentation
//! * [HFP / HSP service-level connection](rfcomm)
//!     * AT command parsing and SLC state machine
//!     * CVSD / mSBC / LC3-SWB codec selection handshake
//! * [BLE-MIDI codec](midi) with GATT characteristic glue
//! * [Per-device persistent state](storage)
//!
//! ## Crate features
//! The following crate features are available.
//!
//! * `hfp`: Enables telephony profiles (RFCOMM service-level connection and
//!   SCO sockets).
//! * `midi`: Enables the BLE-MIDI codec and GATT application.
//! * `ldac`, `lc3plus`: Enable the respective optional A2DP codecs. When
//!   disabled the codec is omitted from capability advertisement.
//!
//! To enable all crate features specify the `full` crate feature.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("BlueAudio only supports the Linux operating system.");

use dbus::{
    arg::{prop_cast, AppendAll, PropMap, RefArg, Variant},
    nonblock::{stdintf::org_freedesktop_dbus::ObjectManager, Proxy, SyncConnection},
    Path,
};
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use macaddr::MacAddr6;
use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::EnumString;
use tokio::task::JoinError;

pub(crate) const SERVICE_NAME: &str = "org.bluez";
pub(crate) const ERR_PREFIX: &str = "org.bluez.Error.";
pub(crate) const TIMEOUT: Duration = Duration::from_secs(120);

macro_rules! publish_path {
    ($path:expr) => {
        concat!("/org/blaudio/", $path)
    };
}

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

pub mod a2dp;
pub mod asrsync;
pub mod codec;
mod config;
pub mod ffb;
#[cfg(feature = "midi")]
#[cfg_attr(docsrs, doc(cfg(feature = "midi")))]
pub mod midi;
pub mod pcm;
#[cfg(feature = "hfp")]
#[cfg_attr(docsrs, doc(cfg(feature = "hfp")))]
pub mod rfcomm;
pub mod rtp;
#[cfg(feature = "hfp")]
#[cfg_attr(docsrs, doc(cfg(feature = "hfp")))]
pub mod sco;
pub mod service;
mod sock;
pub mod storage;
mod sys;
pub mod transport;
pub mod worker;

pub use crate::config::*;

#[doc(no_inline)]
pub use uuid::Uuid;

/// Daemon error.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Daemon error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth operation failed
    Failed,
    /// Bluetooth operation in progress
    InProgress,
    /// Bluetooth device does not exist
    DoesNotExist,
    /// invalid arguments for Bluetooth operation
    InvalidArguments,
    /// Bluetooth operation not available
    NotAvailable,
    /// Bluetooth operation not authorized
    NotAuthorized,
    /// Bluetooth operation not permitted
    NotPermitted,
    /// Bluetooth device not ready
    NotReady,
    /// Bluetooth operation not supported
    NotSupported,
    /// invalid codec configuration: {0}
    #[strum(disabled)]
    InvalidConfiguration(a2dp::CapabilityField),
    /// codec not supported or no capability overlap
    #[strum(disabled)]
    CodecNotSupported,
    /// Bluetooth link lost
    #[strum(disabled)]
    LinkLost,
    /// local audio client disconnected
    #[strum(disabled)]
    ClientDisconnected,
    /// resource exhausted
    #[strum(disabled)]
    ResourceExhausted,
    /// service-level connection negotiation timed out
    #[strum(disabled)]
    NegotiationTimeout,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// the target object was either not present or removed
    #[strum(disabled)]
    NotFound,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal daemon error kind.
///
/// This is most likely caused by incompatibilities between this daemon
/// and the version of the Bluetooth service.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        let kind = match err
            .name()
            .and_then(|name| name.strip_prefix(ERR_PREFIX))
            .and_then(|s| ErrorKind::from_str(s).ok())
        {
            Some(kind) => kind,
            _ => ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
        };
        Self { kind, message: err.message().unwrap_or_default().to_string() }
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

impl From<std::io::Error> for Error {
    /// Classifies OS errors the way the streaming engine needs them:
    /// connection aborts on the Bluetooth socket are a lost link, a broken
    /// pipe is the local client going away, fd or memory exhaustion is
    /// fatal to the transport.
    fn from(err: std::io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::ECONNABORTED) | Some(libc::ECONNRESET) | Some(libc::ENOTCONN)
            | Some(libc::ETIMEDOUT) => ErrorKind::LinkLost,
            Some(libc::EPIPE) => ErrorKind::ClientDisconnected,
            Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Internal(InternalErrorKind::Io(err.kind())),
        };
        Self { kind, message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

/// Daemon result.
pub type Result<T> = std::result::Result<T, Error>;

/// Address of a Bluetooth peer or controller.
///
/// Octets are kept in display order, most significant first. The daemon
/// meets addresses in three shapes: colon-hexadecimal strings in BlueZ
/// properties and storage file names ([FromStr]/[Display]), the
/// underscore-separated component of BlueZ object paths
/// ([from_path_component](Self::from_path_component)), and the reversed
/// `bdaddr_t` octet order at the socket layer.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address([u8; 6]);

impl Address {
    /// An address from octets in display order.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The wildcard address `00:00:00:00:00:00`, used to bind a socket to
    /// any local controller.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// Whether this is the wildcard address.
    pub fn is_any(&self) -> bool {
        *self == Self::any()
    }

    /// Octets in display order.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parses the address component of a BlueZ object path, e.g. the
    /// `00_1B_DC_07_32_03` in `/org/bluez/hci0/dev_00_1B_DC_07_32_03`.
    pub fn from_path_component(s: &str) -> std::result::Result<Self, InvalidAddress> {
        Self::parse_with(s, '_')
    }

    fn parse_with(s: &str, separator: char) -> std::result::Result<Self, InvalidAddress> {
        let err = || InvalidAddress(s.to_string());
        let mut octets = [0; 6];
        let mut parts = s.split(separator);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(err)?;
            // exactly two hex digits per octet; BlueZ never abbreviates
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        match parts.next() {
            None => Ok(Self(octets)),
            Some(_) => Err(err()),
        }
    }

    /// Converts to the socket-layer representation, which stores octets in
    /// reverse order.
    pub(crate) fn to_bdaddr(self) -> sys::bdaddr_t {
        let mut b = self.0;
        b.reverse();
        sys::bdaddr_t { b }
    }

    /// Converts from the socket-layer representation.
    pub(crate) fn from_bdaddr(addr: sys::bdaddr_t) -> Self {
        let mut octets = addr.b;
        octets.reverse();
        Self(octets)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{octet:02X}")?;
        }
        Ok(())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        Self::parse_with(s, ':')
    }
}

impl From<MacAddr6> for Address {
    fn from(mac: MacAddr6) -> Self {
        Self::new(mac.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        MacAddr6::from(addr.octets())
    }
}

/// Malformed Bluetooth address error, carrying the offending input.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "malformed Bluetooth address {:?}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Gets all D-Bus objects from the BlueZ service.
async fn all_dbus_objects(
    connection: &SyncConnection,
) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
    let p = Proxy::new(SERVICE_NAME, "/", TIMEOUT, connection);
    Ok(p.get_managed_objects().await?)
}

/// Read value from D-Bus dictionary.
pub(crate) fn read_dict<'a, T: 'static>(
    dict: &'a HashMap<String, Variant<Box<dyn RefArg + 'static>>>, key: &str,
) -> Result<&'a T> {
    prop_cast(dict, key)
        .ok_or_else(|| Error::new(ErrorKind::Internal(InternalErrorKind::MissingKey(key.to_string()))))
}

/// Result of calling one of our D-Bus methods.
type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Call method on Arc D-Bus object we are serving.
fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_string_round_trip() {
        let addr = Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03]);
        assert_eq!(addr.to_string(), "00:1B:DC:07:32:03");
        assert_eq!("00:1B:DC:07:32:03".parse::<Address>().unwrap(), addr);
        assert!("00:1B:DC".parse::<Address>().is_err());
        assert!("00:1B:DC:07:32:ZZ".parse::<Address>().is_err());
        // octets are always two digits, never abbreviated or extended
        assert!("0:1B:DC:07:32:03".parse::<Address>().is_err());
        assert!("00:1B:DC:07:32:03:44".parse::<Address>().is_err());
    }

    #[test]
    fn address_from_object_path_component() {
        let addr = Address::from_path_component("00_1B_DC_07_32_03").unwrap();
        assert_eq!(addr, Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03]));
        assert!(Address::from_path_component("00:1B:DC:07:32:03").is_err());
    }

    #[test]
    fn address_bdaddr_order_is_reversed() {
        let addr = Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03]);
        let bdaddr = addr.to_bdaddr();
        assert_eq!(bdaddr.b, [0x03, 0x32, 0x07, 0xDC, 0x1B, 0x00]);
        assert_eq!(Address::from_bdaddr(bdaddr), addr);
        assert!(Address::any().is_any());
    }

    #[test]
    fn io_error_classification() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.kind, ErrorKind::LinkLost);
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EPIPE));
        assert_eq!(err.kind, ErrorKind::ClientDisconnected);
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err.kind, ErrorKind::Internal(InternalErrorKind::Io(_))));
    }
}
