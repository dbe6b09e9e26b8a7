//! BLE-MIDI GATT application.
//!
//! Publishes the MIDI service with its data I/O characteristic and
//! registers the tree with the adapter's GATT manager. Write and notify
//! sides are socket based: `AcquireWrite` and `AcquireNotify` hand a
//! sequential-packet socket to the Bluetooth service, and the ATT MTU
//! reported in the acquire options bounds every notification packet.

use dbus::{arg::PropMap, nonblock::Proxy, Path};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::ServiceInner;
use crate::{
    method_call,
    midi::{self, Decoder, Encoder, MidiEvent},
    sock,
    worker::BtStream,
    Error, ErrorKind, Result, SERVICE_NAME, TIMEOUT,
};

pub(crate) const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

const APP_PATH: &str = publish_path!("midi");
const SERVICE_PATH: &str = publish_path!("midi/service0");
const CHARACTERISTIC_PATH: &str = publish_path!("midi/service0/char0");

/// Default ATT MTU when the Bluetooth service does not report one.
const DEFAULT_ATT_MTU: usize = 23;

/// Interface tokens of the published GATT objects.
pub(crate) struct MidiTokens {
    pub service: IfaceToken<Arc<MidiGattService>>,
    pub characteristic: IfaceToken<Arc<MidiCharacteristic>>,
}

/// The published MIDI primary service.
pub struct MidiGattService;

/// The MIDI data I/O characteristic.
pub struct MidiCharacteristic {
    shared: Arc<MidiShared>,
}

struct NotifySink {
    stream: Arc<BtStream>,
    encoder: Encoder,
}

struct MidiShared {
    events_tx: mpsc::UnboundedSender<MidiEvent>,
    notify: Mutex<Option<NotifySink>>,
}

/// Handle of the registered BLE-MIDI application.
///
/// Incoming MIDI events arrive on [events](Self::events); outgoing
/// messages are sent with [send](Self::send).
pub struct MidiApplication {
    shared: Arc<MidiShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MidiEvent>>>,
}

impl std::fmt::Debug for MidiApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("MidiApplication")
    }
}

impl MidiApplication {
    /// Takes the receiver of decoded incoming MIDI events.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<MidiEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Encodes and notifies one MIDI message to the subscribed central.
    ///
    /// Silently dropped while nobody subscribed.
    pub async fn send(&self, timestamp_ms: u16, message: &[u8]) -> Result<()> {
        let packet = {
            let mut guard = self.shared.notify.lock().unwrap();
            let Some(sink) = guard.as_mut() else { return Ok(()) };
            if let Err(err) = sink.encoder.add(timestamp_ms, message) {
                return Err(Error::with_message(ErrorKind::InvalidArguments, err.to_string()));
            }
            Some((sink.stream.clone(), sink.encoder.take_packet()))
        };
        if let Some((stream, packet)) = packet {
            stream.send(&packet).await.map_err(Error::from)?;
        }
        Ok(())
    }
}

impl MidiCharacteristic {
    fn acquire_mtu(options: &PropMap) -> usize {
        dbus::arg::prop_cast::<u16>(options, "mtu").map(|mtu| *mtu as usize).unwrap_or(DEFAULT_ATT_MTU)
    }

    /// Accepts the write direction: BlueZ forwards central writes into the
    /// returned socket; a task decodes them into MIDI events.
    fn acquire_write(&self, options: &PropMap) -> Result<(dbus::arg::OwnedFd, u16)> {
        let mtu = Self::acquire_mtu(options);
        let (ours, theirs) = sock::socketpair(libc::SOCK_SEQPACKET).map_err(Error::from)?;
        let stream = BtStream::new(ours)?;

        let events_tx = self.shared.events_tx.clone();
        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            let mut buf = vec![0u8; mtu.max(64)];
            loop {
                let n = match stream.recv(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                match decoder.decode(&buf[..n]) {
                    Ok(events) => {
                        for event in events {
                            if events_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => log::warn!("Dropping malformed BLE-MIDI packet: {err}"),
                }
            }
            log::debug!("BLE-MIDI write socket closed");
        });

        Ok((owned_fd_for_dbus(theirs), mtu as u16))
    }

    /// Accepts the notify direction: our packets written to the returned
    /// socket are forwarded as characteristic notifications.
    fn acquire_notify(&self, options: &PropMap) -> Result<(dbus::arg::OwnedFd, u16)> {
        let mtu = Self::acquire_mtu(options);
        let (ours, theirs) = sock::socketpair(libc::SOCK_SEQPACKET).map_err(Error::from)?;
        let stream = BtStream::new(ours)?;
        *self.shared.notify.lock().unwrap() =
            Some(NotifySink { stream, encoder: Encoder::new(mtu) });
        Ok((owned_fd_for_dbus(theirs), mtu as u16))
    }
}

fn owned_fd_for_dbus(fd: sock::OwnedFd) -> dbus::arg::OwnedFd {
    use std::os::unix::io::IntoRawFd;
    unsafe { dbus::arg::OwnedFd::new(fd.into_raw_fd()) }
}

pub(crate) fn register_interfaces(cr: &mut Crossroads) -> MidiTokens {
    let service = cr.register(GATT_SERVICE_INTERFACE, |ib: &mut IfaceBuilder<Arc<MidiGattService>>| {
        cr_property!(ib, "UUID", _reg => {
            Some(midi::SERVICE_UUID.to_string())
        });
        cr_property!(ib, "Primary", _reg => {
            Some(true)
        });
    });

    let characteristic =
        cr.register(GATT_CHARACTERISTIC_INTERFACE, |ib: &mut IfaceBuilder<Arc<MidiCharacteristic>>| {
            cr_property!(ib, "UUID", _reg => {
                Some(midi::CHARACTERISTIC_UUID.to_string())
            });
            cr_property!(ib, "Service", _reg => {
                Some(Path::new(SERVICE_PATH).unwrap())
            });
            cr_property!(ib, "Flags", _reg => {
                Some(vec![
                    "read".to_string(),
                    "write-without-response".to_string(),
                    "notify".to_string(),
                ])
            });

            ib.method_with_cr_async(
                "ReadValue",
                ("options",),
                ("value",),
                |ctx, cr, (_options,): (PropMap,)| {
                    method_call(ctx, cr, |_reg: Arc<MidiCharacteristic>| async move {
                        // the MIDI characteristic always reads empty
                        Ok((Vec::<u8>::new(),))
                    })
                },
            );

            ib.method_with_cr_async(
                "AcquireWrite",
                ("options",),
                ("fd", "mtu"),
                |ctx, cr, (options,): (PropMap,)| {
                    method_call(ctx, cr, |reg: Arc<MidiCharacteristic>| async move {
                        reg.acquire_write(&options).map_err(super::dbus_err)
                    })
                },
            );

            ib.method_with_cr_async(
                "AcquireNotify",
                ("options",),
                ("fd", "mtu"),
                |ctx, cr, (options,): (PropMap,)| {
                    method_call(ctx, cr, |reg: Arc<MidiCharacteristic>| async move {
                        reg.acquire_notify(&options).map_err(super::dbus_err)
                    })
                },
            );
        });

    MidiTokens { service, characteristic }
}

/// Publishes the MIDI GATT tree and registers it on the given adapter.
pub(crate) async fn register_application(
    inner: &Arc<ServiceInner>, adapter_name: &str,
) -> Result<MidiApplication> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(MidiShared { events_tx, notify: Mutex::new(None) });

    {
        let mut cr = inner.crossroads.lock().await;
        cr.insert(
            Path::new(SERVICE_PATH).unwrap(),
            &[inner.midi_tokens.service],
            Arc::new(MidiGattService),
        );
        cr.insert(
            Path::new(CHARACTERISTIC_PATH).unwrap(),
            &[inner.midi_tokens.characteristic],
            Arc::new(MidiCharacteristic { shared: shared.clone() }),
        );
    }

    let adapter_path = Path::new(format!("/org/bluez/{adapter_name}")).unwrap();
    let proxy = Proxy::new(SERVICE_NAME, adapter_path, TIMEOUT, inner.connection.clone());
    log::debug!("Registering BLE-MIDI application on {adapter_name}");
    proxy
        .method_call::<(), _, _, _>(
            GATT_MANAGER_INTERFACE,
            "RegisterApplication",
            (Path::new(APP_PATH).unwrap(), PropMap::new()),
        )
        .await?;

    Ok(MidiApplication { shared, events_rx: Mutex::new(Some(events_rx)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_socket_decodes_into_events() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MidiShared { events_tx, notify: Mutex::new(None) });
        let characteristic = MidiCharacteristic { shared };

        use dbus::arg::{RefArg, Variant};
        let mut options = PropMap::new();
        options.insert("mtu".to_string(), Variant(64u16.box_clone()));
        let (fd, mtu) = characteristic.acquire_write(&options).unwrap();
        assert_eq!(mtu, 64);

        // feed one packet through the acquired socket end
        use std::os::unix::io::IntoRawFd;
        let their_end = unsafe { crate::sock::OwnedFd::new(fd.into_raw_fd()) };
        let their_stream = BtStream::new(their_end).unwrap();
        let mut encoder = Encoder::new(64);
        encoder.add(0x55, &[0x90, 60, 100]).unwrap();
        their_stream.send(&encoder.take_packet()).await.unwrap();

        let event =
            tokio::time::timeout(std::time::Duration::from_secs(2), events_rx.recv()).await.unwrap();
        assert_eq!(event, Some(MidiEvent { timestamp_ms: 0x55, message: vec![0x90, 60, 100] }));
    }

    #[tokio::test]
    async fn notify_send_respects_att_mtu() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MidiShared { events_tx, notify: Mutex::new(None) });
        let characteristic = MidiCharacteristic { shared: shared.clone() };
        let app = MidiApplication { shared, events_rx: Mutex::new(None) };

        let options = PropMap::new();
        let (fd, mtu) = characteristic.acquire_notify(&options).unwrap();
        assert_eq!(mtu as usize, DEFAULT_ATT_MTU);

        use std::os::unix::io::IntoRawFd;
        let their_end = unsafe { crate::sock::OwnedFd::new(fd.into_raw_fd()) };
        let their_stream = BtStream::new(their_end).unwrap();

        app.send(0x10, &[0x90, 60, 100]).await.unwrap();
        let mut buf = [0u8; 64];
        let n = their_stream.recv(&mut buf).await.unwrap();
        assert!(n <= DEFAULT_ATT_MTU);
        let events = Decoder::new().decode(&buf[..n]).unwrap();
        assert_eq!(events[0].message, vec![0x90, 60, 100]);
    }
}
