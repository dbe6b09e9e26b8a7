//! Media end-point objects and the media transport proxy.
//!
//! One `org.bluez.MediaEndpoint1` object is published per local stream
//! end-point and registered with the adapter's `org.bluez.Media1`. The
//! remote device picks a configuration through `SelectConfiguration`;
//! BlueZ then creates a media transport object and calls
//! `SetConfiguration`, upon which the pending transport is created in the
//! arena. Acquisition goes the other way: we call `Acquire`/`TryAcquire`
//! on the transport object and receive the socket with its MTUs.

use dbus::{
    arg::{PropMap, RefArg, Variant},
    nonblock::Proxy,
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{os::unix::io::IntoRawFd, sync::Arc};
use uuid::{uuid, Uuid};

use super::{dbus_err, parse_device_path, ServiceInner, MEDIA_INTERFACE};
use crate::{
    a2dp::{Capability, LocalSep, SelectPolicy, StreamDirection},
    method_call, read_dict,
    sock::OwnedFd,
    transport::{AcquiredLink, AdapterId, Manager, Profile},
    Error, ErrorKind, Result, SERVICE_NAME, TIMEOUT,
};

pub(crate) const ENDPOINT_INTERFACE: &str = "org.bluez.MediaEndpoint1";

/// Audio source service class.
pub const UUID_AUDIO_SOURCE: Uuid = uuid!("0000110a-0000-1000-8000-00805f9b34fb");
/// Audio sink service class.
pub const UUID_AUDIO_SINK: Uuid = uuid!("0000110b-0000-1000-8000-00805f9b34fb");

/// A local stream end-point published over D-Bus.
pub struct RegisteredEndpoint {
    sep: LocalSep,
    adapter: AdapterId,
    manager: Manager,
}

impl RegisteredEndpoint {
    /// Service class UUID advertised by this end-point.
    fn uuid(&self) -> Uuid {
        match self.sep.direction {
            StreamDirection::Source => UUID_AUDIO_SOURCE,
            StreamDirection::Sink => UUID_AUDIO_SINK,
        }
    }

    /// Computes the configuration answered to a remote selection request.
    fn select_configuration(&self, peer_caps: &[u8]) -> Result<Vec<u8>> {
        let policy = SelectPolicy::from_config(self.manager.config());
        select_for_peer(&self.sep, peer_caps, &policy)
    }

    fn set_configuration(&self, transport_path: &Path<'static>, props: &PropMap) -> Result<()> {
        let raw: &Vec<u8> = read_dict(props, "Configuration")?;
        let configuration = Capability::parse(self.sep.codec, raw)?;
        configuration.check()?;

        let (_adapter_name, address) = parse_device_path(transport_path)
            .or_else(|| {
                let device: Option<&Path> = dbus::arg::prop_cast(props, "Device");
                device.and_then(parse_device_path)
            })
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "unparsable device path"))?;

        let profile = match self.sep.direction {
            StreamDirection::Source => Profile::A2dpSource,
            StreamDirection::Sink => Profile::A2dpSink,
        };
        log::info!(
            "Configuring {} end-point for {address}: {}",
            self.sep.codec,
            hex::encode(raw)
        );
        self.manager.create_a2dp_transport(
            self.adapter,
            address,
            profile,
            configuration,
            transport_path.to_string(),
        )?;
        Ok(())
    }

    async fn clear_configuration(&self, transport_path: &Path<'static>) {
        if let Some(id) = self.manager.transport_by_path(transport_path) {
            if let Err(err) = self.manager.destroy(id).await {
                log::error!("Cannot destroy transport for {transport_path}: {err}");
            }
        }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(ENDPOINT_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => {
                Some(reg.uuid().to_string())
            });
            cr_property!(ib, "Codec", reg => {
                Some(reg.sep.codec.capability_byte())
            });
            cr_property!(ib, "Capabilities", reg => {
                Some(reg.sep.capabilities.to_bytes())
            });
            cr_property!(ib, "DelayReporting", reg => {
                Some(reg.sep.delay_reporting)
            });

            ib.method_with_cr_async(
                "SelectConfiguration",
                ("capabilities",),
                ("configuration",),
                |ctx, cr, (capabilities,): (Vec<u8>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        reg.select_configuration(&capabilities).map(|c| (c,)).map_err(dbus_err)
                    })
                },
            );

            ib.method_with_cr_async(
                "SetConfiguration",
                ("transport", "properties"),
                (),
                |ctx, cr, (transport, props): (Path<'static>, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        reg.set_configuration(&transport, &props).map_err(dbus_err)
                    })
                },
            );

            ib.method_with_cr_async(
                "ClearConfiguration",
                ("transport",),
                (),
                |ctx, cr, (transport,): (Path<'static>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        reg.clear_configuration(&transport).await;
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

/// Selects a configuration for a peer's capability blob.
///
/// The peer blob is intersected with our advertised capabilities before
/// the best-value selection runs; an empty overlap surfaces as
/// [CodecNotSupported](ErrorKind::CodecNotSupported).
pub(crate) fn select_for_peer(sep: &LocalSep, peer_caps: &[u8], policy: &SelectPolicy) -> Result<Vec<u8>> {
    let peer = Capability::parse(sep.codec, peer_caps)?;
    let intersection = sep.capabilities.intersect(&peer)?;
    let configuration = intersection.select(policy)?;
    configuration.check()?;
    Ok(configuration.to_bytes())
}

/// Publishes and registers all configured end-points on an adapter.
pub(crate) async fn register_adapter_endpoints(
    inner: &Arc<ServiceInner>, adapter_name: &str, adapter: AdapterId,
) -> Result<()> {
    let adapter_path = Path::new(format!("/org/bluez/{adapter_name}")).unwrap();
    let proxy = Proxy::new(SERVICE_NAME, adapter_path, TIMEOUT, inner.connection.clone());

    for (index, sep) in crate::a2dp::local_seps(inner.manager.config()).into_iter().enumerate() {
        let path = Path::new(format!(
            "{}/{}/{}/{}",
            publish_path!("a2dp"),
            adapter_name,
            index,
            sep.direction
        ))
        .unwrap();
        log::debug!("Publishing end-point {path}: {} {}", sep.codec, sep.direction);

        let mut props = PropMap::new();
        let uuid = match sep.direction {
            StreamDirection::Source => UUID_AUDIO_SOURCE,
            StreamDirection::Sink => UUID_AUDIO_SINK,
        };
        props.insert("UUID".to_string(), Variant(uuid.to_string().box_clone()));
        props.insert("Codec".to_string(), Variant(sep.codec.capability_byte().box_clone()));
        props
            .insert("Capabilities".to_string(), Variant(sep.capabilities.to_bytes().box_clone()));
        props.insert("DelayReporting".to_string(), Variant(sep.delay_reporting.box_clone()));

        let reg =
            Arc::new(RegisteredEndpoint { sep, adapter, manager: inner.manager.clone() });
        {
            let mut cr = inner.crossroads.lock().await;
            cr.insert(path.clone(), &[inner.endpoint_token], reg);
        }

        if let Err(err) = proxy
            .method_call::<(), _, _, _>(MEDIA_INTERFACE, "RegisterEndpoint", (path.clone(), props))
            .await
        {
            // BlueZ without the codec support rejects the registration;
            // keep the remaining end-points working
            log::warn!("Cannot register end-point {path}: {err}");
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredEndpoint>> = cr.remove(&path);
        }
    }
    Ok(())
}

/// Proxy of a BlueZ media transport object.
pub struct MediaTransport {
    proxy: Proxy<'static, Arc<dbus::nonblock::SyncConnection>>,
}

impl std::fmt::Debug for MediaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MediaTransport {{ {} }}", self.proxy.path)
    }
}

impl MediaTransport {
    pub(crate) fn new(inner: &Arc<ServiceInner>, path: Path<'static>) -> Self {
        Self { proxy: Proxy::new(SERVICE_NAME, path, TIMEOUT, inner.connection.clone()) }
    }

    /// Acquires the transport socket, blocking stream start on the remote
    /// side.
    pub async fn acquire(&self) -> Result<AcquiredLink> {
        let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) = self
            .proxy
            .method_call(super::MEDIA_TRANSPORT_INTERFACE, "Acquire", ())
            .await?;
        Ok(AcquiredLink { fd: unsafe { OwnedFd::new(fd.into_raw_fd()) }, mtu_read, mtu_write })
    }

    /// Acquires the transport socket only if the stream has already been
    /// started by the remote side.
    pub async fn try_acquire(&self) -> Result<AcquiredLink> {
        let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) = self
            .proxy
            .method_call(super::MEDIA_TRANSPORT_INTERFACE, "TryAcquire", ())
            .await?;
        Ok(AcquiredLink { fd: unsafe { OwnedFd::new(fd.into_raw_fd()) }, mtu_read, mtu_write })
    }

    /// Releases the transport socket.
    pub async fn release(&self) -> Result<()> {
        self.proxy
            .method_call::<(), _, _, _>(super::MEDIA_TRANSPORT_INTERFACE, "Release", ())
            .await?;
        Ok(())
    }

    /// Forwards an absolute volume to the remote device.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
        self.proxy.set(super::MEDIA_TRANSPORT_INTERFACE, "Volume", volume).await?;
        Ok(())
    }
}

/// Applies media transport property changes to the owning PCM.
///
/// Returns whether the change announced a remote-initiated sink stream
/// that should be acquired now.
pub(crate) fn transport_properties_changed(
    inner: &Arc<ServiceInner>, object: &Path<'static>, changed: PropMap,
) -> bool {
    let Some(id) = inner.manager.transport_by_path(object) else { return false };
    let Ok(pcm) = inner.manager.transport_pcm(id) else { return false };

    if let Some(volume) = dbus::arg::prop_cast::<u16>(&changed, "Volume") {
        let level_db = bluez_volume_to_db(*volume);
        log::debug!("Transport {object}: volume {volume} ({level_db:.1} dB)");
        let mut volumes = pcm.volumes();
        for v in &mut volumes {
            v.level_db = level_db;
            v.hw_mute = *volume == 0;
        }
        let _ = pcm.set_volumes(&volumes);
    }

    if let Some(delay) = dbus::arg::prop_cast::<u16>(&changed, "Delay") {
        // BlueZ reports the presentation delay in decimilliseconds
        pcm.set_codec_delay_dms(*delay as i32);
    }

    if let Some(state) = dbus::arg::prop_cast::<String>(&changed, "State") {
        log::debug!("Transport {object}: state {state}");
        if state == "pending" {
            let is_sink = matches!(inner.manager.transport_profile(id), Ok(Profile::A2dpSink));
            let idle =
                matches!(inner.manager.transport_state(id), Ok(crate::transport::TransportState::Pending));
            return is_sink && idle;
        }
    }
    false
}

/// Maps the AVRCP absolute volume range 0..=127 to an amplitude level.
fn bluez_volume_to_db(volume: u16) -> f64 {
    let volume = volume.min(127);
    if volume == 0 {
        return -96.0;
    }
    20.0 * (f64::from(volume) / 127.0).log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2dp::{sbc, CodecCapabilities, CodecId};

    fn sbc_sep(direction: StreamDirection) -> LocalSep {
        LocalSep {
            codec: CodecId::Sbc,
            direction,
            capabilities: Capability::Sbc(sbc::Capabilities::full()),
            delay_reporting: true,
        }
    }

    #[test]
    fn select_for_peer_returns_checked_configuration() {
        let sep = sbc_sep(StreamDirection::Source);
        let peer = sbc::Capabilities::full().to_bytes();
        let config = select_for_peer(&sep, &peer, &SelectPolicy::default()).unwrap();
        let parsed = Capability::parse(CodecId::Sbc, &config).unwrap();
        parsed.check().unwrap();
        assert_eq!(parsed.sample_rate(), Some(48000));
    }

    #[test]
    fn select_for_peer_rejects_garbage() {
        let sep = sbc_sep(StreamDirection::Sink);
        let err = select_for_peer(&sep, &[0x00], &SelectPolicy::default()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidConfiguration(_)));
    }

    #[test]
    fn volume_mapping_covers_the_range() {
        assert_eq!(bluez_volume_to_db(0), -96.0);
        assert!(bluez_volume_to_db(127).abs() < 1e-9);
        let half = bluez_volume_to_db(64);
        assert!(half < -5.0 && half > -7.0, "half volume: {half}");
    }
}
