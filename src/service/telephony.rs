//! Telephony profile objects for HFP and HSP.
//!
//! One `org.bluez.Profile1` object is registered per enabled role. The
//! Bluetooth service calls `NewConnection` with the RFCOMM socket of each
//! accepted link; a per-link task then drives the service-level
//! connection, and the negotiated voice codec is applied to the SCO
//! transport of the device.

use dbus::{
    arg::{PropMap, RefArg, Variant},
    nonblock::Proxy,
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{
    collections::HashMap,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};
use uuid::{uuid, Uuid};

use super::{parse_device_path, ServiceInner};
use crate::{
    codec::HfpCodec,
    method_call,
    rfcomm::{spawn_link, LinkEvent, Role, Slc},
    sock::{self, OwnedFd},
    transport::{Manager, Profile, TransportId},
    worker::{shutdown_pair, Shutdown},
    Address, Result, SERVICE_NAME, TIMEOUT,
};

pub(crate) const PROFILE_INTERFACE: &str = "org.bluez.Profile1";
pub(crate) const PROFILE_MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
pub(crate) const PROFILE_MANAGER_PATH: &str = "/org/bluez";

/// Hands-free unit service class.
pub const UUID_HFP_HF: Uuid = uuid!("0000111e-0000-1000-8000-00805f9b34fb");
/// Hands-free audio gateway service class.
pub const UUID_HFP_AG: Uuid = uuid!("0000111f-0000-1000-8000-00805f9b34fb");
/// Headset service class.
pub const UUID_HSP_HS: Uuid = uuid!("00001108-0000-1000-8000-00805f9b34fb");
/// Headset audio gateway service class.
pub const UUID_HSP_AG: Uuid = uuid!("00001112-0000-1000-8000-00805f9b34fb");

/// A telephony profile published over D-Bus.
pub struct RegisteredTelephonyProfile {
    profile: Profile,
    manager: Manager,
    links: Mutex<HashMap<Address, Shutdown>>,
}

impl RegisteredTelephonyProfile {
    fn role(&self) -> Role {
        match self.profile {
            Profile::HfpAg | Profile::HspAg => Role::Ag,
            _ => Role::Hf,
        }
    }

    fn new_connection(&self, device_path: &Path<'static>, fd: OwnedFd) -> Result<()> {
        let (adapter_name, address) = parse_device_path(device_path).ok_or_else(|| {
            crate::Error::with_message(crate::ErrorKind::InvalidArguments, "unparsable device path")
        })?;
        let adapter = self
            .manager
            .adapter_by_name(&adapter_name)
            .ok_or_else(|| crate::Error::new(crate::ErrorKind::NotFound))?;

        let mut codecs = vec![HfpCodec::Cvsd];
        if self.profile.is_sco()
            && matches!(self.profile, Profile::HfpAg | Profile::HfpHf)
            && self.manager.adapter_msbc_capable(adapter)
        {
            codecs.push(HfpCodec::Msbc);
        }

        let transport_path = format!("{}/{}", device_path, self.profile);
        let transport = self.manager.create_sco_transport(
            adapter,
            address,
            self.profile,
            HfpCodec::Cvsd,
            transport_path,
        )?;

        let stream = RfcommStream::new(fd)?;
        let slc = match self.role() {
            Role::Ag => Slc::new_ag(codecs),
            Role::Hf => Slc::new_hf(codecs),
        };
        log::info!("Telephony link from {address}: {} as {}", self.profile, self.role());

        let (shutdown, mut token) = shutdown_pair();
        self.links.lock().unwrap().insert(address, shutdown);

        let manager = self.manager.clone();
        tokio::spawn(async move {
            let mut handle = spawn_link(stream, slc);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = handle.event() => match event {
                        Some(event) => apply_link_event(&manager, transport, address, event),
                        // the link task ended: a read error on RFCOMM means
                        // the device is gone even if the Bluetooth service
                        // never says so, so tear the transport down fully
                        None => break,
                    },
                }
            }
            handle.stop().await;
            if let Err(err) = manager.destroy(transport).await {
                log::error!("Cannot destroy SCO transport of {address}: {err}");
            }
        });
        Ok(())
    }

    fn disconnect(&self, address: Address) {
        if let Some(shutdown) = self.links.lock().unwrap().remove(&address) {
            shutdown.trigger();
        }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(PROFILE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "NewConnection",
                ("device", "fd", "fd_properties"),
                (),
                |ctx, cr, (device_path, fd, _props): (Path<'static>, dbus::arg::OwnedFd, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let fd = unsafe { OwnedFd::new(fd.into_raw_fd()) };
                        reg.new_connection(&device_path, fd).map_err(super::dbus_err)
                    })
                },
            );

            ib.method_with_cr_async(
                "RequestDisconnection",
                ("device",),
                (),
                |ctx, cr, (device_path,): (Path<'static>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        if let Some((_, address)) = parse_device_path(&device_path) {
                            reg.disconnect(address);
                        }
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |_reg: Arc<Self>| async move { Ok(()) })
            });
        })
    }
}

fn apply_link_event(manager: &Manager, transport: TransportId, address: Address, event: LinkEvent) {
    match event {
        LinkEvent::SlcConnected => {
            log::info!("Service-level connection established with {address}");
        }
        LinkEvent::CodecSelected(codec) => {
            if let Err(err) = manager.set_sco_codec(transport, codec) {
                log::warn!("Cannot apply codec {codec} on {transport}: {err}");
            }
        }
        LinkEvent::Battery(level) => manager.set_device_battery(address, level),
        LinkEvent::Xapl(features) => manager.set_device_xapl(address, features),
        LinkEvent::IndicatorUpdate { name, value } => {
            log::debug!("Indicator {name} of {address}: {value}");
        }
        LinkEvent::Ring => log::debug!("RING from {address}"),
        LinkEvent::MicGain(gain) | LinkEvent::SpeakerGain(gain) => {
            log::debug!("Gain update from {address}: {gain}");
        }
    }
}

/// Registers all enabled telephony profiles with the Bluetooth service.
pub(crate) async fn register_profiles(inner: &Arc<ServiceInner>) -> Result<()> {
    let config = inner.manager.config().clone();
    let roles: &[(Profile, Uuid, bool, Option<u16>)] = &[
        (Profile::HfpAg, UUID_HFP_AG, config.profiles.hfp_ag, Some(0x0108)),
        (Profile::HfpHf, UUID_HFP_HF, config.profiles.hfp_hf, Some(0x0108)),
        (Profile::HspAg, UUID_HSP_AG, config.profiles.hsp_ag, Some(0x0102)),
        (Profile::HspHs, UUID_HSP_HS, config.profiles.hsp_hs, Some(0x0102)),
    ];

    let proxy =
        Proxy::new(SERVICE_NAME, PROFILE_MANAGER_PATH, TIMEOUT, inner.connection.clone());
    for &(profile, uuid, enabled, version) in roles {
        if !enabled {
            continue;
        }
        let path =
            Path::new(format!("{}/{}", publish_path!("profile"), profile.to_string().replace('-', "_")))
                .unwrap();
        log::debug!("Publishing telephony profile {path}");

        let reg = Arc::new(RegisteredTelephonyProfile {
            profile,
            manager: inner.manager.clone(),
            links: Mutex::new(HashMap::new()),
        });
        {
            let mut cr = inner.crossroads.lock().await;
            cr.insert(path.clone(), &[inner.profile_token], reg);
        }

        let mut options = PropMap::new();
        if let Some(version) = version {
            options.insert("Version".to_string(), Variant(version.box_clone()));
        }
        options.insert("RequireAuthentication".to_string(), Variant(true.box_clone()));

        if let Err(err) = proxy
            .method_call::<(), _, _, _>(
                PROFILE_MANAGER_INTERFACE,
                "RegisterProfile",
                (path.clone(), uuid.to_string(), options),
            )
            .await
        {
            log::warn!("Cannot register profile {path}: {err}");
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredTelephonyProfile>> = cr.remove(&path);
        }
    }
    Ok(())
}

/// RFCOMM socket handed over by the Bluetooth service, wrapped for async
/// stream I/O.
pub(crate) struct RfcommStream {
    fd: AsyncFd<OwnedFd>,
}

impl RfcommStream {
    pub(crate) fn new(fd: OwnedFd) -> Result<Self> {
        sock::set_nonblocking(&fd).map_err(crate::Error::from)?;
        Ok(Self { fd: AsyncFd::new(fd).map_err(crate::Error::from)? })
    }

    /// Raw descriptor, for diagnostics.
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

impl AsyncRead for RfcommStream {
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| sock::read(inner.get_ref(), buf)) {
                Ok(result) => return Poll::Ready(result.map(|_| ())),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for RfcommStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        sock::shutdown(self.fd.get_ref(), libc::SHUT_WR)?;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rfcomm_stream_over_socketpair() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = sock::socketpair(libc::SOCK_STREAM).unwrap();
        let mut a = RfcommStream::new(a).unwrap();
        let mut b = RfcommStream::new(b).unwrap();
        assert!(a.as_raw_fd() >= 0);

        a.write_all(b"AT+BRSF=59\r").await.unwrap();
        let mut buf = [0u8; 32];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"AT+BRSF=59\r");
    }
}
