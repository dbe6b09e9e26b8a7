//! Transport object graph.
//!
//! Adapters, devices and transports live in an id-indexed arena owned by
//! the [Manager]. Entities reference each other by id, never by owning
//! pointer, so the `device -> transport -> device` back-edges of the
//! object model cannot form reference cycles and tearing everything down
//! is a plain arena drain. Lookups go through the arena mutex; critical
//! sections never hold it across an await point.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, Weak},
};
use strum::Display;
use tokio::sync::mpsc;

use crate::{
    a2dp::{Capability, CodecId},
    asrsync::Decimillis,
    codec::CodecRegistry,
    pcm::{Pcm, SampleFormat},
    sock::OwnedFd,
    storage::{DeviceState, Storage},
    worker::{self, BtStream, StreamParams, WorkerHandle},
    Address, Config, Error, ErrorKind, Result,
};

#[cfg(feature = "hfp")]
use crate::codec::HfpCodec;
#[cfg(feature = "hfp")]
use crate::worker::spawn_sco_worker;

macro_rules! entity_id {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

entity_id!(
    /// Handle of an adapter in the arena.
    AdapterId
);
entity_id!(
    /// Handle of a device in the arena.
    DeviceId
);
entity_id!(
    /// Handle of a transport in the arena.
    TransportId
);

/// Profile a transport was negotiated on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum Profile {
    /// A2DP towards a remote sink.
    #[strum(serialize = "A2DP-source")]
    A2dpSource,
    /// A2DP from a remote source.
    #[strum(serialize = "A2DP-sink")]
    A2dpSink,
    /// HFP audio gateway.
    #[strum(serialize = "HFP-AG")]
    HfpAg,
    /// HFP hands-free.
    #[strum(serialize = "HFP-HF")]
    HfpHf,
    /// HSP audio gateway.
    #[strum(serialize = "HSP-AG")]
    HspAg,
    /// HSP headset.
    #[strum(serialize = "HSP-HS")]
    HspHs,
    /// BLE-MIDI link.
    #[strum(serialize = "MIDI")]
    Midi,
}

impl Profile {
    /// Whether this is one of the A2DP profiles.
    pub fn is_a2dp(&self) -> bool {
        matches!(self, Self::A2dpSource | Self::A2dpSink)
    }

    /// Whether the media link of this profile is a SCO socket.
    pub fn is_sco(&self) -> bool {
        matches!(self, Self::HfpAg | Self::HfpHf | Self::HspAg | Self::HspHs)
    }
}

/// Transport lifecycle state.
///
/// Forward transitions follow `idle -> pending -> active -> idle`;
/// `aborted` is absorbing and triggers destruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Display)]
pub enum TransportState {
    /// No Bluetooth socket held.
    #[default]
    #[strum(serialize = "idle")]
    Idle,
    /// Configuration accepted, acquisition may proceed.
    #[strum(serialize = "pending")]
    Pending,
    /// Socket held, workers running.
    #[strum(serialize = "active")]
    Active,
    /// Fatal error observed; the transport is being destroyed.
    #[strum(serialize = "aborted")]
    Aborted,
}

impl TransportState {
    fn transition(self, to: TransportState) -> Result<()> {
        use TransportState::*;
        let ok = matches!(
            (self, to),
            (Idle, Pending) | (Pending, Active) | (Active, Idle) | (Pending, Idle) | (_, Aborted)
        ) && self != Aborted;
        if ok {
            Ok(())
        } else {
            Err(Error::with_message(
                ErrorKind::NotPermitted,
                format!("invalid transport state transition: {self} -> {to}"),
            ))
        }
    }
}

/// Media-specific part of a transport.
#[derive(Debug)]
pub enum TransportMedia {
    /// A2DP stream with its selected codec configuration.
    A2dp {
        /// Validated single-valued configuration blob.
        configuration: Capability,
    },
    /// SCO voice link with its negotiated codec.
    #[cfg(feature = "hfp")]
    Sco {
        /// Selected voice codec.
        codec: HfpCodec,
    },
    /// BLE-MIDI link; framing handled by the MIDI codec.
    #[cfg(feature = "midi")]
    Midi,
}

/// Bluetooth socket with its link MTUs, as returned by acquisition.
#[derive(Debug)]
pub struct AcquiredLink {
    /// Connected media socket.
    pub fd: OwnedFd,
    /// Largest datagram the link delivers when reading.
    pub mtu_read: u16,
    /// Largest datagram the link accepts for writing.
    pub mtu_write: u16,
}

#[derive(Debug)]
struct Link {
    bt: Arc<BtStream>,
    mtu_read: u16,
    mtu_write: u16,
}

struct AdapterEntry {
    name: String,
    address: Address,
    msbc_capable: bool,
    devices: HashSet<DeviceId>,
}

struct DeviceEntry {
    adapter: AdapterId,
    address: Address,
    name: String,
    battery: Option<u8>,
    xapl_features: Option<u8>,
    state: DeviceState,
    transports: HashMap<String, TransportId>,
}

/// Snapshot of the mutable attributes of a device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Friendly name, empty when unknown.
    pub name: String,
    /// Battery level in percent, when reported.
    pub battery: Option<u8>,
    /// Apple accessory feature bits announced over XAPL.
    pub xapl_features: Option<u8>,
}

struct TransportEntry {
    device: DeviceId,
    profile: Profile,
    path: String,
    media: TransportMedia,
    state: TransportState,
    clients: u32,
    link: Option<Link>,
    pcm_main: Arc<Pcm>,
    pcm_back: Option<Arc<Pcm>>,
    workers: Vec<WorkerHandle>,
}

#[derive(Default)]
struct Arena {
    next_id: u64,
    adapters: HashMap<u64, AdapterEntry>,
    devices: HashMap<u64, DeviceEntry>,
    transports: HashMap<u64, TransportEntry>,
}

impl Arena {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn transport(&mut self, id: TransportId) -> Result<&mut TransportEntry> {
        self.transports.get_mut(&id.0).ok_or_else(|| Error::new(ErrorKind::NotFound))
    }
}

struct Shared {
    config: Arc<Config>,
    registry: CodecRegistry,
    storage: Storage,
    arena: Mutex<Arena>,
    fault_tx: mpsc::UnboundedSender<(TransportId, Error)>,
}

/// Owner of the transport object graph.
///
/// Cheap to clone; all clones share the arena. Must be created inside a
/// tokio runtime, as worker faults are handled on a background task.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let arena = self.shared.arena.lock().unwrap();
        f.debug_struct("Manager")
            .field("adapters", &arena.adapters.len())
            .field("devices", &arena.devices.len())
            .field("transports", &arena.transports.len())
            .finish()
    }
}

impl Manager {
    /// Creates the manager with its backing storage.
    pub fn new(config: Arc<Config>, registry: CodecRegistry) -> Result<Self> {
        let storage = Storage::new(&config.storage_root)?;
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            registry,
            storage,
            arena: Mutex::new(Arena::default()),
            fault_tx,
        });

        // a lost link or exhausted resources abort the transport, nothing
        // else; the adapter and device stay around
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some((id, err)) = fault_rx.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                let manager = Manager { shared };
                match err.kind {
                    ErrorKind::LinkLost | ErrorKind::ResourceExhausted => {
                        log::warn!("Aborting {id}: {err}");
                        if let Err(err) = manager.abort(id).await {
                            log::error!("Cannot abort {id}: {err}");
                        }
                    }
                    _ => log::warn!("Worker fault on {id}: {err}"),
                }
            }
        });

        Ok(Self { shared })
    }

    /// The daemon configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.shared.config
    }

    /// Registers a Bluetooth controller.
    pub fn adapter_added(&self, name: &str, address: Address, msbc_capable: bool) -> AdapterId {
        let mut arena = self.shared.arena.lock().unwrap();
        let id = AdapterId(arena.next());
        log::info!("Adding adapter {name} ({address}) as {id}");
        arena.adapters.insert(
            id.0,
            AdapterEntry { name: name.to_string(), address, msbc_capable, devices: HashSet::new() },
        );
        id
    }

    /// Looks up an adapter by controller name.
    pub fn adapter_by_name(&self, name: &str) -> Option<AdapterId> {
        let arena = self.shared.arena.lock().unwrap();
        arena.adapters.iter().find(|(_, a)| a.name == name).map(|(&id, _)| AdapterId(id))
    }

    /// Whether the controller is eligible for wideband speech.
    pub fn adapter_msbc_capable(&self, id: AdapterId) -> bool {
        let arena = self.shared.arena.lock().unwrap();
        arena.adapters.get(&id.0).map(|a| a.msbc_capable).unwrap_or(false)
    }

    /// Removes a controller, destroying every dependent entity.
    pub async fn adapter_removed(&self, name: &str) {
        let transports: Vec<TransportId> = {
            let arena = self.shared.arena.lock().unwrap();
            let Some((&adapter_id, _)) = arena.adapters.iter().find(|(_, a)| a.name == name) else {
                return;
            };
            arena
                .transports
                .iter()
                .filter(|(_, t)| {
                    arena.devices.get(&t.device.0).map(|d| d.adapter.0 == adapter_id).unwrap_or(false)
                })
                .map(|(&id, _)| TransportId(id))
                .collect()
        };
        log::info!("Removing adapter {name} with {} transports", transports.len());
        for id in transports {
            if let Err(err) = self.destroy(id).await {
                log::error!("Cannot destroy {id}: {err}");
            }
        }
        let mut arena = self.shared.arena.lock().unwrap();
        arena.adapters.retain(|_, a| a.name != name);
    }

    fn device_for(
        arena: &mut Arena, storage: &Storage, adapter: AdapterId, address: Address,
    ) -> Result<DeviceId> {
        if let Some((&id, _)) =
            arena.devices.iter().find(|(_, d)| d.adapter == adapter && d.address == address)
        {
            return Ok(DeviceId(id));
        }
        if !arena.adapters.contains_key(&adapter.0) {
            return Err(Error::new(ErrorKind::NotFound));
        }
        let id = DeviceId(arena.next());
        log::info!("Adding device {address} as {id}");
        let state = storage.load(address);
        arena.devices.insert(
            id.0,
            DeviceEntry {
                adapter,
                address,
                name: String::new(),
                battery: None,
                xapl_features: None,
                state,
                transports: HashMap::new(),
            },
        );
        arena.adapters.get_mut(&adapter.0).unwrap().devices.insert(id);
        Ok(id)
    }

    /// Creates an A2DP transport in pending state.
    ///
    /// The configuration must be single-valued and pass validation; this is
    /// what gates the transport from ever leaving pending with a bogus
    /// codec setup.
    pub fn create_a2dp_transport(
        &self, adapter: AdapterId, peer: Address, profile: Profile, configuration: Capability,
        path: String,
    ) -> Result<TransportId> {
        if !profile.is_a2dp() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "not an A2DP profile"));
        }
        configuration.check()?;
        let channels =
            configuration.channels().ok_or_else(|| Error::new(ErrorKind::CodecNotSupported))?;
        let rate =
            configuration.sample_rate().ok_or_else(|| Error::new(ErrorKind::CodecNotSupported))?;
        let codec = configuration.codec_id();

        let pcm_main = Arc::new(Pcm::new(SampleFormat::S16Le, channels, rate)?);
        let pcm_back = match &configuration {
            Capability::FastStream(fs) if fs.has_voice() => {
                let rate = fs.voice_sample_rate().unwrap_or(16000);
                Some(Arc::new(Pcm::new(SampleFormat::S16Le, 1, rate)?))
            }
            _ => None,
        };

        let mut arena = self.shared.arena.lock().unwrap();
        let device = Self::device_for(&mut arena, &self.shared.storage, adapter, peer)?;
        let entry = arena.devices.get_mut(&device.0).unwrap();
        if entry.transports.contains_key(&path) {
            return Err(Error::with_message(ErrorKind::InProgress, format!("transport exists: {path}")));
        }

        // restore persisted volume and per-codec delay adjustment
        pcm_main.set_volumes(&entry.state.volumes(channels as usize)).ok();
        pcm_main.set_soft_volume(entry.state.soft_volume);
        pcm_main.set_client_delay_dms(entry.state.client_delay(codec));

        let id = TransportId(arena.next());
        log::info!("Creating {id} for {peer}: {profile}, codec {codec}");
        arena.devices.get_mut(&device.0).unwrap().transports.insert(path.clone(), id);
        arena.transports.insert(
            id.0,
            TransportEntry {
                device,
                profile,
                path,
                media: TransportMedia::A2dp { configuration },
                state: TransportState::Pending,
                clients: 0,
                link: None,
                pcm_main,
                pcm_back,
                workers: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Creates a SCO transport in pending state.
    #[cfg(feature = "hfp")]
    pub fn create_sco_transport(
        &self, adapter: AdapterId, peer: Address, profile: Profile, codec: HfpCodec, path: String,
    ) -> Result<TransportId> {
        if !profile.is_sco() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "not a SCO profile"));
        }
        let rate = codec.sample_rate();
        let speaker = Arc::new(Pcm::new(SampleFormat::S16Le, 1, rate)?);
        let mic = Arc::new(Pcm::new(SampleFormat::S16Le, 1, rate)?);

        let mut arena = self.shared.arena.lock().unwrap();
        let device = Self::device_for(&mut arena, &self.shared.storage, adapter, peer)?;
        let entry = arena.devices.get_mut(&device.0).unwrap();
        if entry.transports.contains_key(&path) {
            return Err(Error::with_message(ErrorKind::InProgress, format!("transport exists: {path}")));
        }
        speaker.set_volumes(&entry.state.volumes(1)).ok();
        speaker.set_soft_volume(entry.state.soft_volume);

        let id = TransportId(arena.next());
        log::info!("Creating {id} for {peer}: {profile}, codec {codec}");
        arena.devices.get_mut(&device.0).unwrap().transports.insert(path.clone(), id);
        arena.transports.insert(
            id.0,
            TransportEntry {
                device,
                profile,
                path,
                media: TransportMedia::Sco { codec },
                state: TransportState::Pending,
                clients: 0,
                link: None,
                pcm_main: speaker,
                pcm_back: Some(mic),
                workers: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Looks up a transport by its service object path.
    pub fn transport_by_path(&self, path: &str) -> Option<TransportId> {
        let arena = self.shared.arena.lock().unwrap();
        arena.transports.iter().find(|(_, t)| t.path == path).map(|(&id, _)| TransportId(id))
    }

    /// Current lifecycle state of a transport.
    pub fn transport_state(&self, id: TransportId) -> Result<TransportState> {
        let mut arena = self.shared.arena.lock().unwrap();
        Ok(arena.transport(id)?.state)
    }

    /// Profile a transport was negotiated on.
    pub fn transport_profile(&self, id: TransportId) -> Result<Profile> {
        let mut arena = self.shared.arena.lock().unwrap();
        Ok(arena.transport(id)?.profile)
    }

    /// Link MTUs of an acquired transport.
    pub fn transport_mtus(&self, id: TransportId) -> Result<Option<(u16, u16)>> {
        let mut arena = self.shared.arena.lock().unwrap();
        Ok(arena.transport(id)?.link.as_ref().map(|l| (l.mtu_read, l.mtu_write)))
    }

    /// The main-stream PCM of a transport.
    pub fn transport_pcm(&self, id: TransportId) -> Result<Arc<Pcm>> {
        let mut arena = self.shared.arena.lock().unwrap();
        Ok(arena.transport(id)?.pcm_main.clone())
    }

    /// The backchannel PCM of a transport, when the codec has one.
    pub fn transport_backchannel_pcm(&self, id: TransportId) -> Result<Option<Arc<Pcm>>> {
        let mut arena = self.shared.arena.lock().unwrap();
        Ok(arena.transport(id)?.pcm_back.clone())
    }

    /// Activates a transport with the socket obtained from the Bluetooth
    /// service, spawning its workers.
    ///
    /// Additional acquisitions of an already active transport only add a
    /// client reference.
    pub async fn acquire(&self, id: TransportId, link: AcquiredLink) -> Result<()> {
        let spawn = {
            let mut arena = self.shared.arena.lock().unwrap();
            let transport = arena.transport(id)?;
            match transport.state {
                TransportState::Active => {
                    transport.clients += 1;
                    return Ok(());
                }
                TransportState::Pending => {
                    TransportState::Pending.transition(TransportState::Active)?
                }
                TransportState::Idle => {
                    // re-acquisition walks the full forward path
                    TransportState::Idle.transition(TransportState::Pending)?;
                    TransportState::Pending.transition(TransportState::Active)?;
                }
                TransportState::Aborted => {
                    return Err(Error::with_message(ErrorKind::NotPermitted, "transport is aborted"));
                }
            }

            let bt = BtStream::new(link.fd)?;
            transport.link =
                Some(Link { bt: bt.clone(), mtu_read: link.mtu_read, mtu_write: link.mtu_write });
            transport.state = TransportState::Active;
            transport.clients = 1;

            SpawnPlan {
                profile: transport.profile,
                media_params: match &transport.media {
                    TransportMedia::A2dp { configuration } => Some(configuration.clone()),
                    #[cfg(feature = "hfp")]
                    TransportMedia::Sco { .. } => None,
                    #[cfg(feature = "midi")]
                    TransportMedia::Midi => None,
                },
                #[cfg(feature = "hfp")]
                sco_codec: match &transport.media {
                    TransportMedia::Sco { codec } => Some(*codec),
                    _ => None,
                },
                pcm_main: transport.pcm_main.clone(),
                pcm_back: transport.pcm_back.clone(),
                bt,
                mtu_read: link.mtu_read,
                mtu_write: link.mtu_write,
            }
        };

        let workers = match self.spawn_workers(id, spawn) {
            Ok(workers) => workers,
            Err(err) => {
                // no worker started: revert to idle and close the socket
                let mut arena = self.shared.arena.lock().unwrap();
                if let Ok(transport) = arena.transport(id) {
                    transport.link = None;
                    transport.clients = 0;
                    if transport.state == TransportState::Active {
                        transport.state = TransportState::Idle;
                    }
                }
                return Err(err);
            }
        };
        let mut arena = self.shared.arena.lock().unwrap();
        match arena.transport(id) {
            Ok(transport) => transport.workers = workers,
            Err(err) => {
                // destroyed while spawning: stop the freshly started workers
                drop(arena);
                for worker in workers {
                    worker.stop().await;
                }
                return Err(err);
            }
        }
        log::info!("Acquired {id} (MTU {}/{})", link.mtu_read, link.mtu_write);
        Ok(())
    }

    fn spawn_workers(&self, id: TransportId, plan: SpawnPlan) -> Result<Vec<WorkerHandle>> {
        let fault_tx = self.shared.fault_tx.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(err) = rx.recv().await {
                let _ = fault_tx.send((id, err));
            }
        });

        let mut workers = Vec::new();
        match plan.profile {
            Profile::A2dpSource | Profile::A2dpSink => {
                let configuration = plan.media_params.as_ref().expect("A2DP transport has a configuration");
                let codec = self.shared.registry.create(configuration)?;
                let rate = configuration.sample_rate().unwrap_or(48000);
                let params = StreamParams {
                    rate,
                    channels: configuration.channels().unwrap_or(2),
                    mtu_write: plan.mtu_write as usize,
                    mtu_read: plan.mtu_read as usize,
                    rtp_clock_rate: rate,
                    rtp_codec_header_len: configuration.rtp_codec_header_len(),
                };
                let worker = match plan.profile {
                    Profile::A2dpSource => worker::spawn_encoder(
                        params,
                        plan.pcm_main.clone(),
                        plan.bt.clone(),
                        codec,
                        tx.clone(),
                    ),
                    _ => worker::spawn_decoder(
                        params,
                        plan.pcm_main.clone(),
                        plan.bt.clone(),
                        codec,
                        tx.clone(),
                    ),
                };
                workers.push(worker);

                if let Some(back) = &plan.pcm_back {
                    // FastStream voice backchannel runs opposite to the
                    // main stream
                    let codec = self.shared.registry.create(configuration)?;
                    let params = StreamParams {
                        rate: back.rate,
                        channels: back.channels,
                        mtu_write: plan.mtu_write as usize,
                        mtu_read: plan.mtu_read as usize,
                        rtp_clock_rate: back.rate,
                        rtp_codec_header_len: None,
                    };
                    let worker = match plan.profile {
                        Profile::A2dpSource => {
                            worker::spawn_decoder(params, back.clone(), plan.bt.clone(), codec, tx.clone())
                        }
                        _ => worker::spawn_encoder(params, back.clone(), plan.bt.clone(), codec, tx.clone()),
                    };
                    workers.push(worker);
                }
            }
            #[cfg(feature = "hfp")]
            Profile::HfpAg | Profile::HfpHf | Profile::HspAg | Profile::HspHs => {
                let codec = plan.sco_codec.expect("SCO transport has a codec");
                let framing = match codec {
                    HfpCodec::Cvsd => worker::ScoFraming::Cvsd,
                    wideband => {
                        let (encoder, decoder) = self.shared.registry.create_hfp_pair(wideband)?;
                        worker::ScoFraming::Msbc { encoder, decoder }
                    }
                };
                let mic = plan.pcm_back.clone().expect("SCO transport has a microphone PCM");
                let params = StreamParams {
                    rate: codec.sample_rate(),
                    channels: 1,
                    mtu_write: plan.mtu_write as usize,
                    mtu_read: plan.mtu_read as usize,
                    rtp_clock_rate: codec.sample_rate(),
                    rtp_codec_header_len: None,
                };
                workers.push(spawn_sco_worker(params, plan.pcm_main.clone(), mic, plan.bt.clone(), framing, tx));
            }
            #[cfg(not(feature = "hfp"))]
            Profile::HfpAg | Profile::HfpHf | Profile::HspAg | Profile::HspHs => {
                return Err(Error::new(ErrorKind::NotSupported));
            }
            Profile::Midi => {
                // MIDI moves through the GATT characteristic socket; no
                // PCM worker is involved
            }
        }
        Ok(workers)
    }

    /// Releases a transport: stops workers, closes the Bluetooth socket and
    /// returns to idle. Idempotent.
    pub async fn release(&self, id: TransportId) -> Result<()> {
        let workers = {
            let mut arena = self.shared.arena.lock().unwrap();
            let Ok(transport) = arena.transport(id) else { return Ok(()) };
            if transport.state != TransportState::Active {
                return Ok(());
            }
            if transport.clients > 1 {
                transport.clients -= 1;
                return Ok(());
            }
            std::mem::take(&mut transport.workers)
        };

        for worker in workers {
            worker.stop().await;
        }

        let mut arena = self.shared.arena.lock().unwrap();
        if let Ok(transport) = arena.transport(id) {
            // closes the socket: the workers held the only other references
            transport.link = None;
            transport.clients = 0;
            if transport.state == TransportState::Active {
                transport.state = TransportState::Idle;
            }
        }
        log::info!("Released {id}");
        Ok(())
    }

    /// Destroys a transport: release, detach from the device, drop. The
    /// last transport of a device persists its state and drops the device.
    pub async fn destroy(&self, id: TransportId) -> Result<()> {
        self.release(id).await?;

        let mut arena = self.shared.arena.lock().unwrap();
        let Some(transport) = arena.transports.remove(&id.0) else { return Ok(()) };
        log::info!("Destroyed {id}");

        let Some(device) = arena.devices.get_mut(&transport.device.0) else { return Ok(()) };
        device.transports.remove(&transport.path);

        if let TransportMedia::A2dp { configuration } = &transport.media {
            let codec = configuration.codec_id();
            let volumes = transport.pcm_main.volumes();
            device.state.set_volumes(&volumes);
            device.state.soft_volume = transport.pcm_main.soft_volume();
            device.state.set_client_delay(codec, transport.pcm_main.client_delay_dms());
        }

        if device.transports.is_empty() {
            let address = device.address;
            let state = device.state.clone();
            let adapter = device.adapter;
            let device_id = transport.device;
            arena.devices.remove(&device_id.0);
            if let Some(adapter) = arena.adapters.get_mut(&adapter.0) {
                adapter.devices.remove(&device_id);
            }
            log::info!("Dropping device {address}, persisting state");
            if let Err(err) = self.shared.storage.save(address, &state) {
                log::error!("Cannot persist state for {address}: {err}");
            }
        }
        Ok(())
    }

    /// Destroys every transport of a device that disappeared.
    pub async fn device_removed(&self, address: Address) {
        let ids: Vec<TransportId> = {
            let arena = self.shared.arena.lock().unwrap();
            arena
                .devices
                .values()
                .filter(|d| d.address == address)
                .flat_map(|d| d.transports.values().copied())
                .collect()
        };
        for id in ids {
            if let Err(err) = self.destroy(id).await {
                log::error!("Cannot destroy {id}: {err}");
            }
        }
    }

    /// Marks a transport aborted and destroys it.
    pub async fn abort(&self, id: TransportId) -> Result<()> {
        {
            let mut arena = self.shared.arena.lock().unwrap();
            if let Ok(transport) = arena.transport(id) {
                transport.state = TransportState::Aborted;
            }
        }
        self.destroy(id).await
    }

    /// Flips the codec of a SCO transport.
    ///
    /// Only permitted while no worker is running; the caller stops the
    /// stream around the codec-selection handshake.
    #[cfg(feature = "hfp")]
    pub fn set_sco_codec(&self, id: TransportId, codec: HfpCodec) -> Result<()> {
        let mut arena = self.shared.arena.lock().unwrap();
        let transport = arena.transport(id)?;
        if transport.state == TransportState::Active {
            return Err(Error::with_message(ErrorKind::NotPermitted, "codec change on active transport"));
        }
        match &mut transport.media {
            TransportMedia::Sco { codec: current } => {
                log::info!("Switching {id} voice codec: {current} -> {codec}");
                *current = codec;
                Ok(())
            }
            _ => Err(Error::with_message(ErrorKind::InvalidArguments, "not a SCO transport")),
        }
    }

    /// Attaches a client FIFO to the main PCM of a transport.
    pub fn attach_client(&self, id: TransportId, fifo: OwnedFd) -> Result<()> {
        self.transport_pcm(id)?.attach_client(fifo);
        Ok(())
    }

    /// Schedules a release after the last client went away.
    ///
    /// With a configured keep-alive the transport stays acquired for that
    /// long, so a quickly returning client does not pay the acquisition
    /// round trip; a client reappearing within the window cancels the
    /// release.
    pub fn schedule_release(&self, id: TransportId) {
        let manager = self.clone();
        let keep_alive = self.shared.config.keep_alive;
        tokio::spawn(async move {
            if let Some(keep_alive) = keep_alive {
                tokio::time::sleep(keep_alive).await;
                if manager.transport_pcm(id).map(|pcm| pcm.is_active()).unwrap_or(true) {
                    return;
                }
            }
            if let Err(err) = manager.release(id).await {
                log::error!("Cannot release {id}: {err}");
            }
        });
    }

    /// Updates the battery level reported by a device.
    pub fn set_device_battery(&self, address: Address, level: u8) {
        let mut arena = self.shared.arena.lock().unwrap();
        for device in arena.devices.values_mut() {
            if device.address == address {
                device.battery = Some(level.min(100));
            }
        }
    }

    /// Updates the friendly name of a device.
    pub fn set_device_name(&self, address: Address, name: &str) {
        let mut arena = self.shared.arena.lock().unwrap();
        for device in arena.devices.values_mut() {
            if device.address == address {
                device.name = name.to_string();
            }
        }
    }

    /// Records the Apple accessory feature hints of a device.
    pub fn set_device_xapl(&self, address: Address, features: u8) {
        let mut arena = self.shared.arena.lock().unwrap();
        for device in arena.devices.values_mut() {
            if device.address == address {
                device.xapl_features = Some(features);
            }
        }
    }

    /// Current attributes of a device, when it exists.
    pub fn device_info(&self, address: Address) -> Option<DeviceInfo> {
        let arena = self.shared.arena.lock().unwrap();
        arena.devices.values().find(|d| d.address == address).map(|d| DeviceInfo {
            name: d.name.clone(),
            battery: d.battery,
            xapl_features: d.xapl_features,
        })
    }

    /// Records a client-delay adjustment for the given codec on a device.
    pub fn set_client_delay(&self, address: Address, codec: CodecId, dms: Decimillis) {
        let mut arena = self.shared.arena.lock().unwrap();
        for device in arena.devices.values_mut() {
            if device.address == address {
                device.state.set_client_delay(codec, dms);
            }
        }
    }

    /// Number of live transports, for diagnostics.
    pub fn transport_count(&self) -> usize {
        self.shared.arena.lock().unwrap().transports.len()
    }

    /// Destroys every transport and drops all entities.
    pub async fn shutdown(&self) {
        let ids: Vec<TransportId> = {
            let arena = self.shared.arena.lock().unwrap();
            arena.transports.keys().map(|&id| TransportId(id)).collect()
        };
        for id in ids {
            if let Err(err) = self.destroy(id).await {
                log::error!("Cannot destroy {id} during shutdown: {err}");
            }
        }
        let mut arena = self.shared.arena.lock().unwrap();
        arena.adapters.clear();
    }
}

struct SpawnPlan {
    profile: Profile,
    media_params: Option<Capability>,
    #[cfg(feature = "hfp")]
    sco_codec: Option<HfpCodec>,
    pcm_main: Arc<Pcm>,
    pcm_back: Option<Arc<Pcm>>,
    bt: Arc<BtStream>,
    mtu_read: u16,
    mtu_write: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2dp::{sbc, CodecCapabilities, SelectPolicy};
    use crate::codec::PcmPassthrough;
    use crate::sock;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        let mut root = std::env::temp_dir();
        root.push(format!("blaudio-transport-{:08x}", rand::random::<u32>()));
        config.storage_root = root;
        Arc::new(config)
    }

    fn test_registry() -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        registry.register(CodecId::Sbc, |_config| Ok(Box::new(PcmPassthrough::new(128))));
        registry
    }

    fn sbc_config() -> Capability {
        Capability::Sbc(sbc::Capabilities::full().select(&SelectPolicy::default()).unwrap())
    }

    fn peer() -> Address {
        Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03])
    }

    fn link() -> AcquiredLink {
        let (fd, other) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        std::mem::forget(other);
        AcquiredLink { fd, mtu_read: 672, mtu_write: 672 }
    }

    #[tokio::test]
    async fn lifecycle_follows_the_state_dag() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), true);
        let id = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSource, sbc_config(), "/sep/1".into())
            .unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Pending);
        assert_eq!(manager.transport_mtus(id).unwrap(), None);

        manager.acquire(id, link()).await.unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Active);
        assert_eq!(manager.transport_mtus(id).unwrap(), Some((672, 672)));

        manager.release(id).await.unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Idle);
        assert_eq!(manager.transport_mtus(id).unwrap(), None);

        // release is idempotent
        manager.release(id).await.unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Idle);

        manager.destroy(id).await.unwrap();
        assert_eq!(manager.transport_count(), 0);
        assert!(manager.transport_state(id).is_err());
    }

    #[tokio::test]
    async fn invalid_configuration_never_creates_a_transport() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), false);
        // multi-valued capabilities must not pass the pending gate
        let caps = Capability::Sbc(sbc::Capabilities::full());
        let err = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSource, caps, "/sep/1".into())
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidConfiguration(_)));
        assert_eq!(manager.transport_count(), 0);
    }

    #[tokio::test]
    async fn destroy_from_active_releases_everything() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), true);
        let id = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSink, sbc_config(), "/sep/2".into())
            .unwrap();
        manager.acquire(id, link()).await.unwrap();
        manager.destroy(id).await.unwrap();
        assert_eq!(manager.transport_count(), 0);
        // the device went away with its last transport
        let another = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSink, sbc_config(), "/sep/2".into())
            .unwrap();
        manager.destroy(another).await.unwrap();
    }

    #[tokio::test]
    async fn aborted_is_absorbing() {
        assert!(TransportState::Aborted.transition(TransportState::Idle).is_err());
        assert!(TransportState::Aborted.transition(TransportState::Pending).is_err());
        assert!(TransportState::Idle.transition(TransportState::Active).is_err());
        assert!(TransportState::Idle.transition(TransportState::Pending).is_ok());
        assert!(TransportState::Pending.transition(TransportState::Active).is_ok());
        assert!(TransportState::Active.transition(TransportState::Idle).is_ok());
        assert!(TransportState::Active.transition(TransportState::Aborted).is_ok());
    }

    #[tokio::test]
    async fn second_acquire_adds_a_client_reference() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), true);
        let id = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSource, sbc_config(), "/sep/3".into())
            .unwrap();
        manager.acquire(id, link()).await.unwrap();
        manager.acquire(id, link()).await.unwrap();
        // first release only drops a reference
        manager.release(id).await.unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Active);
        manager.release(id).await.unwrap();
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Idle);
        manager.destroy(id).await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_release_honors_keep_alive() {
        let mut config = Config::default();
        let mut root = std::env::temp_dir();
        root.push(format!("blaudio-keepalive-{:08x}", rand::random::<u32>()));
        config.storage_root = root;
        config.keep_alive = Some(std::time::Duration::from_millis(50));
        let manager = Manager::new(Arc::new(config), test_registry()).unwrap();

        let adapter = manager.adapter_added("hci0", Address::any(), true);
        let id = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSource, sbc_config(), "/sep/7".into())
            .unwrap();
        manager.acquire(id, link()).await.unwrap();

        manager.schedule_release(id);
        // still acquired inside the keep-alive window
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Active);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(manager.transport_state(id).unwrap(), TransportState::Idle);
        manager.destroy(id).await.unwrap();
    }

    #[tokio::test]
    async fn device_attributes_are_tracked() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), true);
        assert_eq!(manager.device_info(peer()), None);

        let id = manager
            .create_a2dp_transport(adapter, peer(), Profile::A2dpSource, sbc_config(), "/sep/9".into())
            .unwrap();
        manager.set_device_name(peer(), "Headphones");
        manager.set_device_battery(peer(), 130);
        manager.set_device_xapl(peer(), 0x06);

        let info = manager.device_info(peer()).unwrap();
        assert_eq!(info.name, "Headphones");
        assert_eq!(info.battery, Some(100));
        assert_eq!(info.xapl_features, Some(0x06));

        manager.destroy(id).await.unwrap();
        assert_eq!(manager.device_info(peer()), None);
    }

    #[cfg(feature = "hfp")]
    #[tokio::test]
    async fn sco_codec_change_requires_stopped_stream() {
        let manager = Manager::new(test_config(), test_registry()).unwrap();
        let adapter = manager.adapter_added("hci0", Address::any(), true);
        let id = manager
            .create_sco_transport(adapter, peer(), Profile::HfpAg, HfpCodec::Cvsd, "/sco/1".into())
            .unwrap();
        manager.set_sco_codec(id, HfpCodec::Msbc).unwrap();

        manager.acquire(id, link()).await.unwrap_err();
        // mSBC needs a registered wideband backend; flip back and acquire
        manager.set_sco_codec(id, HfpCodec::Cvsd).unwrap();
        manager.acquire(id, link()).await.unwrap();
        assert!(manager.set_sco_codec(id, HfpCodec::Msbc).is_err());
        manager.destroy(id).await.unwrap();
    }
}
