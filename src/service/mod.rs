//! Control surface towards the system Bluetooth service.
//!
//! The daemon is a D-Bus peer of BlueZ: it registers media end-points,
//! telephony profiles and the BLE-MIDI GATT application, and consumes
//! media transport acquisition plus object-manager events for adapters
//! and devices appearing and disappearing.

use dbus::{
    message::MatchRule,
    nonblock::{
        stdintf::org_freedesktop_dbus::{
            ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
        },
        Proxy, SyncConnection,
    },
    strings::BusName,
    Message, Path,
};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use lazy_static::lazy_static;
use std::{
    collections::HashSet,
    fmt::{self, Debug, Formatter},
    str::FromStr,
    sync::Arc,
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{all_dbus_objects, transport::Manager, Address, Error, ErrorKind, Result, SERVICE_NAME};

mod endpoint;
#[cfg(feature = "midi")]
mod midi_app;
#[cfg(feature = "hfp")]
mod telephony;

pub use endpoint::{MediaTransport, RegisteredEndpoint};
#[cfg(feature = "midi")]
pub use midi_app::MidiApplication;
#[cfg(feature = "hfp")]
pub use telephony::RegisteredTelephonyProfile;

pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub(crate) const MEDIA_INTERFACE: &str = "org.bluez.Media1";
pub(crate) const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";

/// Shared state of the service connection.
pub(crate) struct ServiceInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: tokio::sync::Mutex<Crossroads>,
    pub endpoint_token: IfaceToken<Arc<RegisteredEndpoint>>,
    #[cfg(feature = "hfp")]
    pub profile_token: IfaceToken<Arc<RegisteredTelephonyProfile>>,
    #[cfg(feature = "midi")]
    pub midi_tokens: midi_app::MidiTokens,
    #[cfg(feature = "midi")]
    pub midi_app: std::sync::Mutex<Option<MidiApplication>>,
    pub manager: Manager,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        // documentation for dbus_tokio::connection::IOResource indicates it is abortable
        self.dbus_task.abort();
    }
}

/// Connection of the daemon to the system Bluetooth service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Debug for Service {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Service {{ {} }}", self.inner.connection.unique_name())
    }
}

/// Object-manager event observed on the Bluetooth service.
#[derive(Debug)]
pub(crate) enum Event {
    ObjectAdded { object: Path<'static>, interfaces: HashSet<String> },
    ObjectRemoved { object: Path<'static>, interfaces: HashSet<String> },
    PropertiesChanged { object: Path<'static>, interface: String, changed: dbus::arg::PropMap },
}

impl Service {
    /// Connects to the system Bluetooth service over D-Bus.
    pub async fn new(manager: Manager) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let endpoint_token = RegisteredEndpoint::register_interface(&mut crossroads);
        #[cfg(feature = "hfp")]
        let profile_token = RegisteredTelephonyProfile::register_interface(&mut crossroads);
        #[cfg(feature = "midi")]
        let midi_tokens = midi_app::register_interfaces(&mut crossroads);

        let inner = Arc::new(ServiceInner {
            connection: connection.clone(),
            crossroads: tokio::sync::Mutex::new(crossroads),
            endpoint_token,
            #[cfg(feature = "hfp")]
            profile_token,
            #[cfg(feature = "midi")]
            midi_tokens,
            #[cfg(feature = "midi")]
            midi_app: std::sync::Mutex::new(None),
            manager,
            dbus_task,
        });

        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner = match mc_inner.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*mc_inner.connection);
            }
        });

        Ok(Self { inner })
    }

    /// Names of the adapters currently known to the Bluetooth service.
    pub async fn adapter_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (path, interfaces) in all_dbus_objects(&self.inner.connection).await? {
            if let Some(name) = parse_adapter_path(&path) {
                if interfaces.contains_key(ADAPTER_INTERFACE) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Serves the Bluetooth service connection until shut down.
    ///
    /// Registers end-points, profiles and the MIDI application on every
    /// adapter matching the configured filter, and mirrors adapter
    /// arrivals and removals into the transport [Manager].
    pub async fn run(&self, mut shutdown: crate::worker::ShutdownToken) -> Result<()> {
        let mut events = self.subscribe_events().await?;

        #[cfg(feature = "hfp")]
        telephony::register_profiles(&self.inner).await?;

        for name in self.adapter_names().await? {
            if let Err(err) = self.serve_adapter(&name).await {
                log::error!("Cannot serve adapter {name}: {err}");
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }

        self.inner.manager.shutdown().await;
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::ObjectAdded { object, interfaces } => {
                if interfaces.contains(ADAPTER_INTERFACE) {
                    if let Some(name) = parse_adapter_path(&object) {
                        let name = name.to_string();
                        if let Err(err) = self.serve_adapter(&name).await {
                            log::error!("Cannot serve adapter {name}: {err}");
                        }
                    }
                }
            }
            Event::ObjectRemoved { object, interfaces } => {
                if interfaces.contains(ADAPTER_INTERFACE) {
                    if let Some(name) = parse_adapter_path(&object) {
                        self.inner.manager.adapter_removed(name).await;
                    }
                } else if interfaces.contains(DEVICE_INTERFACE) {
                    if let Some((_, address)) = parse_device_path(&object) {
                        self.inner.manager.device_removed(address).await;
                    }
                }
            }
            Event::PropertiesChanged { object, interface, changed } => {
                if interface == MEDIA_TRANSPORT_INTERFACE {
                    let pending_sink =
                        endpoint::transport_properties_changed(&self.inner, &object, changed);
                    if pending_sink {
                        // the remote source started streaming towards us
                        if let Err(err) = self.acquire_transport(&object).await {
                            log::warn!("Cannot acquire {object}: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Acquires the Bluetooth socket of a configured transport and starts
    /// its workers.
    ///
    /// For sink transports the socket is only taken over when the remote
    /// side has already started the stream.
    pub async fn acquire_transport(&self, path: &Path<'static>) -> Result<()> {
        let manager = &self.inner.manager;
        let id = manager.transport_by_path(path).ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let proxy = endpoint::MediaTransport::new(&self.inner, path.clone());
        let link = match manager.transport_profile(id)? {
            crate::transport::Profile::A2dpSink => proxy.try_acquire().await?,
            _ => proxy.acquire().await?,
        };
        manager.acquire(id, link).await
    }

    /// Releases the Bluetooth socket of a transport and stops its workers.
    pub async fn release_transport(&self, path: &Path<'static>) -> Result<()> {
        let manager = &self.inner.manager;
        let id = manager.transport_by_path(path).ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        manager.release(id).await?;
        let proxy = endpoint::MediaTransport::new(&self.inner, path.clone());
        proxy.release().await
    }

    async fn serve_adapter(&self, name: &str) -> Result<()> {
        let config = self.inner.manager.config().clone();
        if !config.adapter_filter.is_empty() && !config.adapter_filter.iter().any(|f| f == name) {
            log::debug!("Skipping filtered adapter {name}");
            return Ok(());
        }

        let address = self.adapter_address(name).await?;
        #[cfg(feature = "hfp")]
        let msbc_capable = adapter_dev_id(name)
            .and_then(|dev_id| crate::sco::adapter_features(dev_id).ok())
            .map(|features| features.msbc_capable)
            .unwrap_or(false);
        #[cfg(not(feature = "hfp"))]
        let msbc_capable = false;

        let adapter = self.inner.manager.adapter_added(name, address, msbc_capable);
        endpoint::register_adapter_endpoints(&self.inner, name, adapter).await?;
        #[cfg(feature = "midi")]
        if config.profiles.midi && self.inner.midi_app.lock().unwrap().is_none() {
            let app = midi_app::register_application(&self.inner, name).await?;
            *self.inner.midi_app.lock().unwrap() = Some(app);
        }
        Ok(())
    }

    /// Takes the handle of the registered BLE-MIDI application.
    #[cfg(feature = "midi")]
    #[cfg_attr(docsrs, doc(cfg(feature = "midi")))]
    pub fn midi_application(&self) -> Option<MidiApplication> {
        self.inner.midi_app.lock().unwrap().take()
    }

    async fn adapter_address(&self, name: &str) -> Result<Address> {
        use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
        let path = Path::new(format!("/org/bluez/{name}")).unwrap();
        let proxy = Proxy::new(SERVICE_NAME, path, crate::TIMEOUT, self.inner.connection.clone());
        let address: String = proxy.get(ADAPTER_INTERFACE, "Address").await?;
        Ok(Address::from_str(&address)?)
    }

    async fn subscribe_events(&self) -> Result<futures_mpsc::UnboundedReceiver<Event>> {
        use dbus::message::SignalArgs;
        lazy_static! {
            static ref SERVICE_NAME_BUS: BusName<'static> = BusName::new(SERVICE_NAME).unwrap();
            static ref SERVICE_NAME_REF: Option<&'static BusName<'static>> = Some(&SERVICE_NAME_BUS);
        }

        let (tx, rx) = futures_mpsc::unbounded();
        let handle_msg = move |msg: Message| -> Option<Event> {
            if let Some(ObjectManagerInterfacesAdded { object, interfaces }) =
                ObjectManagerInterfacesAdded::from_message(&msg)
            {
                return Some(Event::ObjectAdded { object, interfaces: interfaces.into_keys().collect() });
            }
            if let Some(ObjectManagerInterfacesRemoved { object, interfaces, .. }) =
                ObjectManagerInterfacesRemoved::from_message(&msg)
            {
                return Some(Event::ObjectRemoved { object, interfaces: interfaces.into_iter().collect() });
            }
            if let (Some(object), Some(PropertiesPropertiesChanged { interface_name, changed_properties, .. })) =
                (msg.path(), PropertiesPropertiesChanged::from_message(&msg))
            {
                return Some(Event::PropertiesChanged {
                    object: object.into_static(),
                    interface: interface_name,
                    changed: changed_properties,
                });
            }
            None
        };

        let connection = &self.inner.connection;
        for rule in [
            ObjectManagerInterfacesAdded::match_rule(*SERVICE_NAME_REF, None),
            ObjectManagerInterfacesRemoved::match_rule(*SERVICE_NAME_REF, None),
            PropertiesPropertiesChanged::match_rule(*SERVICE_NAME_REF, None),
        ] {
            let tx = tx.clone();
            let handle_msg = handle_msg.clone();
            let _match = connection
                .add_match(rule)
                .await?
                .msg_cb(move |msg| {
                    if let Some(event) = handle_msg(msg) {
                        let _ = tx.unbounded_send(event);
                    }
                    true
                });
            // keep the match alive for the lifetime of the connection
            std::mem::forget(_match);
        }

        Ok(rx)
    }
}

/// Extracts the adapter name out of a BlueZ object path.
pub(crate) fn parse_adapter_path<'a>(path: &'a Path) -> Option<&'a str> {
    path.strip_prefix("/org/bluez/")?.split('/').next().filter(|n| n.starts_with("hci"))
}

/// Extracts the device address out of a BlueZ device object path.
pub(crate) fn parse_device_path(path: &Path) -> Option<(String, Address)> {
    let rest = path.strip_prefix("/org/bluez/")?;
    let (adapter, device) = rest.split_once('/')?;
    let address = Address::from_path_component(device.strip_prefix("dev_")?).ok()?;
    Some((adapter.to_string(), address))
}

/// Numeric controller id of an `hciN` adapter name.
pub(crate) fn adapter_dev_id(name: &str) -> Option<u16> {
    name.strip_prefix("hci")?.parse().ok()
}

pub(crate) fn dbus_err(err: Error) -> dbus::MethodErr {
    let name = match &err.kind {
        ErrorKind::InvalidConfiguration(_) | ErrorKind::InvalidArguments => {
            "org.bluez.Error.InvalidArguments"
        }
        ErrorKind::CodecNotSupported | ErrorKind::NotSupported => "org.bluez.Error.NotSupported",
        ErrorKind::NotFound | ErrorKind::DoesNotExist => "org.bluez.Error.DoesNotExist",
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => "org.bluez.Error.NotAuthorized",
        _ => "org.bluez.Error.Failed",
    };
    dbus::MethodErr::from((name, &err.to_string()))
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        dbus_err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_path_parsing() {
        let path = Path::new("/org/bluez/hci0").unwrap();
        assert_eq!(parse_adapter_path(&path), Some("hci0"));
        let path = Path::new("/org/bluez/hci1/dev_00_1B_DC_07_32_03").unwrap();
        assert_eq!(parse_adapter_path(&path), Some("hci1"));
        let path = Path::new("/org/freedesktop/DBus").unwrap();
        assert_eq!(parse_adapter_path(&path), None);
        assert_eq!(adapter_dev_id("hci2"), Some(2));
        assert_eq!(adapter_dev_id("eth0"), None);
    }

    #[test]
    fn device_path_parsing() {
        let path = Path::new("/org/bluez/hci0/dev_00_1B_DC_07_32_03").unwrap();
        let (adapter, address) = parse_device_path(&path).unwrap();
        assert_eq!(adapter, "hci0");
        assert_eq!(address, Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03]));
        let path = Path::new("/org/bluez/hci0").unwrap();
        assert!(parse_device_path(&path).is_none());
    }
}
