//! HFP / HSP service-level connection over RFCOMM.
//!
//! The Bluetooth service hands us a connected RFCOMM socket per telephony
//! link. A per-link task frames AT commands on it and drives the
//! service-level connection (SLC) state machine: feature exchange,
//! codec-negotiation announcement, indicator discovery and event
//! reporting. Codec selection is a message-passing handshake: the link
//! task owns the SLC state and the acquirer awaits a `CodecSelected`
//! answer with a deadline.

use futures::StreamExt;
use pin_project::pin_project;
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use strum::Display;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    codec::HfpCodec,
    worker::{shutdown_pair, Shutdown, ShutdownToken},
    Error, ErrorKind, Result,
};

pub mod at;

use at::{At, AtType};

/// Per-command acknowledgment timeout.
pub const TIMEOUT_ACK: Duration = Duration::from_millis(1000);
/// Idle timeout while the SLC is being established.
pub const TIMEOUT_IDLE: Duration = Duration::from_millis(2500);
/// Retry budget for establishing the SLC.
pub const SLC_RETRIES: usize = 3;

/// AG feature bits announced in `+BRSF`.
pub mod ag_features {
    /// Three-way calling.
    pub const THREE_WAY: u32 = 1 << 0;
    /// Echo cancellation and noise reduction.
    pub const ECNR: u32 = 1 << 1;
    /// Voice recognition.
    pub const VOICE_RECOGNITION: u32 = 1 << 2;
    /// In-band ring tone.
    pub const INBAND_RING: u32 = 1 << 3;
    /// Ability to reject a call.
    pub const REJECT_CALL: u32 = 1 << 5;
    /// Enhanced call status.
    pub const ENHANCED_CALL_STATUS: u32 = 1 << 6;
    /// Codec negotiation.
    pub const CODEC_NEGOTIATION: u32 = 1 << 9;
    /// eSCO S4 settings.
    pub const ESCO_S4: u32 = 1 << 11;
}

/// HF feature bits announced in `AT+BRSF`.
pub mod hf_features {
    /// Echo cancellation and noise reduction.
    pub const ECNR: u32 = 1 << 0;
    /// Call waiting and three-way calling.
    pub const THREE_WAY: u32 = 1 << 1;
    /// Calling line identification.
    pub const CLI: u32 = 1 << 2;
    /// Remote volume control.
    pub const REMOTE_VOLUME: u32 = 1 << 4;
    /// Enhanced call status.
    pub const ENHANCED_CALL_STATUS: u32 = 1 << 5;
    /// Codec negotiation.
    pub const CODEC_NEGOTIATION: u32 = 1 << 7;
    /// eSCO S4 settings.
    pub const ESCO_S4: u32 = 1 << 8;
}

/// Local role on the telephony link.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum Role {
    /// Audio gateway.
    #[strum(serialize = "AG")]
    Ag,
    /// Hands-free unit.
    #[strum(serialize = "HF")]
    Hf,
}

/// Service-level connection state.
///
/// Forward progress only; any protocol error falls back to
/// [Disconnected](SlcState::Disconnected).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
pub enum SlcState {
    /// Nothing established yet.
    #[default]
    #[strum(serialize = "disconnected")]
    Disconnected,
    /// Feature exchange completed.
    #[strum(serialize = "brsf_set")]
    BrsfSet,
    /// Codec list announced.
    #[strum(serialize = "bac_set")]
    BacSet,
    /// Indicator declarations received.
    #[strum(serialize = "cind_test")]
    CindTest,
    /// Indicator values received.
    #[strum(serialize = "cind_get")]
    CindGet,
    /// Event reporting configured.
    #[strum(serialize = "cmer_set")]
    CmerSet,
    /// Service-level connection established.
    #[strum(serialize = "slc_connected")]
    SlcConnected,
    /// Voice codec negotiated on top of the SLC.
    #[strum(serialize = "codec_negotiated")]
    CodecNegotiated,
}

/// One AG status indicator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Indicator {
    /// Indicator name as announced in `+CIND`.
    pub name: String,
    /// Smallest defined value.
    pub min: u8,
    /// Largest defined value.
    pub max: u8,
    /// Current value.
    pub value: u8,
}

impl Indicator {
    fn new(name: &str, min: u8, max: u8, value: u8) -> Self {
        Self { name: name.to_string(), min, max, value }
    }
}

/// The indicator set announced by our AG role.
pub fn default_indicators() -> Vec<Indicator> {
    vec![
        Indicator::new("service", 0, 1, 0),
        Indicator::new("call", 0, 1, 0),
        Indicator::new("callsetup", 0, 3, 0),
        Indicator::new("callheld", 0, 2, 0),
        Indicator::new("signal", 0, 5, 5),
        Indicator::new("roam", 0, 1, 0),
        Indicator::new("battchg", 0, 5, 5),
    ]
}

/// Event surfaced by a telephony link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// The service-level connection is established.
    SlcConnected,
    /// A voice codec has been agreed on.
    CodecSelected(HfpCodec),
    /// An AG indicator changed.
    IndicatorUpdate {
        /// Indicator name.
        name: String,
        /// New value.
        value: u8,
    },
    /// Incoming call signal.
    Ring,
    /// Battery level report in percent.
    Battery(u8),
    /// Apple accessory feature hints from `AT+XAPL`.
    Xapl(u8),
    /// Microphone gain change (0..=15).
    MicGain(u8),
    /// Speaker gain change (0..=15).
    SpeakerGain(u8),
}

/// Output of one dispatched AT message.
#[derive(Debug, Default)]
pub struct Reaction {
    /// Messages to write back to the peer.
    pub replies: Vec<At>,
    /// Events to surface to the daemon.
    pub events: Vec<LinkEvent>,
}

/// Service-level connection state machine.
///
/// Pure state: all I/O is done by the link task, which feeds received
/// messages into [handle](Self::handle) and writes back the returned
/// replies.
pub struct Slc {
    role: Role,
    state: SlcState,
    our_features: u32,
    peer_features: u32,
    our_codecs: Vec<HfpCodec>,
    peer_codecs: Vec<HfpCodec>,
    selected_codec: Option<HfpCodec>,
    proposed_codec: Option<HfpCodec>,
    indicators: Vec<Indicator>,
    reporting: bool,
    mic_gain: u8,
    spk_gain: u8,
}

impl fmt::Debug for Slc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Slc")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("selected_codec", &self.selected_codec)
            .finish_non_exhaustive()
    }
}

impl Slc {
    /// Creates the AG-side state machine.
    pub fn new_ag(codecs: Vec<HfpCodec>) -> Self {
        let mut features = ag_features::THREE_WAY
            | ag_features::REJECT_CALL
            | ag_features::ENHANCED_CALL_STATUS
            | ag_features::ESCO_S4;
        if codecs.iter().any(|c| *c != HfpCodec::Cvsd) {
            features |= ag_features::CODEC_NEGOTIATION;
        }
        Self::new(Role::Ag, features, codecs)
    }

    /// Creates the HF-side state machine.
    pub fn new_hf(codecs: Vec<HfpCodec>) -> Self {
        let mut features = hf_features::CLI | hf_features::REMOTE_VOLUME | hf_features::ESCO_S4;
        if codecs.iter().any(|c| *c != HfpCodec::Cvsd) {
            features |= hf_features::CODEC_NEGOTIATION;
        }
        Self::new(Role::Hf, features, codecs)
    }

    fn new(role: Role, our_features: u32, mut our_codecs: Vec<HfpCodec>) -> Self {
        if !our_codecs.contains(&HfpCodec::Cvsd) {
            // CVSD is mandatory for every HFP implementation
            our_codecs.insert(0, HfpCodec::Cvsd);
        }
        Self {
            role,
            state: SlcState::Disconnected,
            our_features,
            peer_features: 0,
            our_codecs,
            peer_codecs: Vec::new(),
            selected_codec: None,
            proposed_codec: None,
            indicators: default_indicators(),
            reporting: false,
            mic_gain: 7,
            spk_gain: 7,
        }
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current SLC state.
    pub fn state(&self) -> SlcState {
        self.state
    }

    /// Features announced by the peer.
    pub fn peer_features(&self) -> u32 {
        self.peer_features
    }

    /// Negotiated voice codec, once selected.
    pub fn selected_codec(&self) -> Option<HfpCodec> {
        self.selected_codec
    }

    /// Whether the SLC has been fully established.
    pub fn is_connected(&self) -> bool {
        self.state >= SlcState::SlcConnected
    }

    /// The AT command our HF role should emit in the current state.
    pub fn next_command(&self) -> Option<At> {
        if self.role != Role::Hf {
            return None;
        }
        let codec_list =
            self.our_codecs.iter().map(|c| c.id().to_string()).collect::<Vec<_>>().join(",");
        match self.state {
            SlcState::Disconnected => Some(At::set("+BRSF", self.our_features.to_string())),
            SlcState::BrsfSet => Some(At::set("+BAC", codec_list)),
            SlcState::BacSet => Some(At::test("+CIND")),
            SlcState::CindTest => Some(At::get("+CIND")),
            SlcState::CindGet => Some(At::set("+CMER", "3,0,0,1")),
            _ => None,
        }
    }

    /// AG-initiated codec proposal; returns the `+BCS` message to send.
    ///
    /// Fails with [NotSupported](ErrorKind::NotSupported) when the peer
    /// never announced the codec.
    pub fn propose_codec(&mut self, codec: HfpCodec) -> Result<At> {
        if self.role != Role::Ag {
            return Err(Error::with_message(ErrorKind::NotPermitted, "codec proposal is AG-initiated"));
        }
        if !self.is_connected() {
            return Err(Error::with_message(ErrorKind::NotReady, "SLC not established"));
        }
        if !self.our_codecs.contains(&codec) || (codec != HfpCodec::Cvsd && !self.peer_codecs.contains(&codec))
        {
            return Err(Error::with_message(
                ErrorKind::NotSupported,
                format!("codec {codec} not in the hands-free mask"),
            ));
        }
        self.proposed_codec = Some(codec);
        Ok(At::resp("+BCS", codec.id().to_string()))
    }

    /// Dispatches one received message.
    pub fn handle(&mut self, at: &At) -> Result<Reaction> {
        match self.role {
            Role::Ag => self.handle_as_ag(at),
            Role::Hf => self.handle_as_hf(at),
        }
    }

    fn advance(&mut self, state: SlcState, reaction: &mut Reaction) {
        if state > self.state {
            log::debug!("SLC {}: {} -> {}", self.role, self.state, state);
            self.state = state;
            if state == SlcState::SlcConnected {
                reaction.events.push(LinkEvent::SlcConnected);
            }
        }
    }

    fn handle_as_ag(&mut self, at: &At) -> Result<Reaction> {
        let mut reaction = Reaction::default();
        match (at.ty, at.command.as_str()) {
            (AtType::CmdSet, "+BRSF") => {
                self.peer_features = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(0);
                reaction.replies.push(At::resp("+BRSF", self.our_features.to_string()));
                reaction.replies.push(At::ok());
                self.advance(SlcState::BrsfSet, &mut reaction);
            }
            (AtType::CmdSet, "+BAC") => {
                self.peer_codecs = at
                    .value
                    .as_deref()
                    .unwrap_or("")
                    .split(',')
                    .filter_map(|id| id.trim().parse::<u8>().ok())
                    .filter_map(HfpCodec::from_id)
                    .collect();
                reaction.replies.push(At::ok());
                self.advance(SlcState::BacSet, &mut reaction);
            }
            (AtType::CmdTest, "+CIND") => {
                let decl = self
                    .indicators
                    .iter()
                    .map(|i| format!("(\"{}\",({}-{}))", i.name, i.min, i.max))
                    .collect::<Vec<_>>()
                    .join(",");
                reaction.replies.push(At::resp("+CIND", decl));
                reaction.replies.push(At::ok());
                self.advance(SlcState::CindTest, &mut reaction);
            }
            (AtType::CmdGet, "+CIND") => {
                let values =
                    self.indicators.iter().map(|i| i.value.to_string()).collect::<Vec<_>>().join(",");
                reaction.replies.push(At::resp("+CIND", values));
                reaction.replies.push(At::ok());
                self.advance(SlcState::CindGet, &mut reaction);
            }
            (AtType::CmdSet, "+CMER") => {
                let fields: Vec<&str> =
                    at.value.as_deref().unwrap_or("").split(',').map(str::trim).collect();
                self.reporting = fields.get(3).map(|f| *f == "1").unwrap_or(false);
                reaction.replies.push(At::ok());
                self.advance(SlcState::CmerSet, &mut reaction);
                self.advance(SlcState::SlcConnected, &mut reaction);
            }
            (AtType::CmdSet, "+BCS") => {
                let id = at.value.as_deref().unwrap_or("").trim().parse::<u8>().unwrap_or(0);
                match HfpCodec::from_id(id) {
                    Some(codec) if Some(codec) == self.proposed_codec => {
                        self.selected_codec = Some(codec);
                        self.proposed_codec = None;
                        reaction.replies.push(At::ok());
                        reaction.events.push(LinkEvent::CodecSelected(codec));
                        self.advance(SlcState::CodecNegotiated, &mut reaction);
                    }
                    _ => {
                        log::warn!("Unexpected codec confirmation: {id}");
                        reaction.replies.push(At::error());
                    }
                }
            }
            (AtType::CmdSet, "+VGM") => {
                self.mic_gain = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(self.mic_gain);
                reaction.replies.push(At::ok());
                reaction.events.push(LinkEvent::MicGain(self.mic_gain));
            }
            (AtType::CmdSet, "+VGS") => {
                self.spk_gain = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(self.spk_gain);
                reaction.replies.push(At::ok());
                reaction.events.push(LinkEvent::SpeakerGain(self.spk_gain));
            }
            (AtType::CmdSet, "+XAPL") => {
                // vendor-product-version,features
                if let Some(features) = at
                    .value
                    .as_deref()
                    .and_then(|v| v.split(',').nth(1))
                    .and_then(|f| f.trim().parse::<u8>().ok())
                {
                    reaction.events.push(LinkEvent::Xapl(features));
                }
                // announce battery reporting support back
                reaction.replies.push(At::resp("+XAPL", "BlueAudio,6"));
                reaction.replies.push(At::ok());
            }
            (AtType::CmdSet, "+IPHONEACCEV") => {
                if let Some(level) = parse_iphoneaccev_battery(at.value.as_deref().unwrap_or("")) {
                    reaction.events.push(LinkEvent::Battery(level));
                }
                reaction.replies.push(At::ok());
            }
            (AtType::CmdSet, "+NREC") | (AtType::CmdSet, "+CCWA") | (AtType::CmdSet, "+CLIP")
            | (AtType::CmdSet, "+CMEE") | (AtType::CmdSet, "+CHLD") | (AtType::Cmd, "+CHUP")
            | (AtType::CmdSet, "+BIA") => {
                reaction.replies.push(At::ok());
            }
            (AtType::CmdTest, "+CHLD") => {
                reaction.replies.push(At::resp("+CHLD", "(0,1,2,3)"));
                reaction.replies.push(At::ok());
            }
            _ => {
                log::debug!("Unhandled AT message: {at}");
                reaction.replies.push(At::error());
            }
        }
        Ok(reaction)
    }

    fn handle_as_hf(&mut self, at: &At) -> Result<Reaction> {
        let mut reaction = Reaction::default();
        match (at.ty, at.command.as_str()) {
            (AtType::Resp, "+BRSF") => {
                self.peer_features = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(0);
            }
            (AtType::Resp, "+CIND") => {
                let value = at.value.as_deref().unwrap_or("");
                if self.state < SlcState::CindTest {
                    self.indicators = parse_cind_declarations(value);
                } else {
                    for (indicator, value) in
                        self.indicators.iter_mut().zip(value.split(',').map(str::trim))
                    {
                        indicator.value = value.parse().unwrap_or(indicator.value);
                    }
                }
            }
            (AtType::Resp, "+CIEV") => {
                let value = at.value.as_deref().unwrap_or("");
                if let Some((index, value)) = parse_ciev(value) {
                    if let Some(indicator) = self.indicators.get_mut(index.saturating_sub(1)) {
                        indicator.value = value;
                        reaction.events.push(LinkEvent::IndicatorUpdate {
                            name: indicator.name.clone(),
                            value,
                        });
                        if indicator.name == "battchg" {
                            reaction.events.push(LinkEvent::Battery(value.min(5) * 20));
                        }
                    }
                }
            }
            (AtType::Resp, "+BCS") => {
                let id = at.value.as_deref().unwrap_or("").trim().parse::<u8>().unwrap_or(0);
                match HfpCodec::from_id(id).filter(|c| self.our_codecs.contains(c)) {
                    Some(codec) => {
                        // accept the gateway's proposal
                        self.selected_codec = Some(codec);
                        reaction.replies.push(At::set("+BCS", codec.id().to_string()));
                        reaction.events.push(LinkEvent::CodecSelected(codec));
                        self.advance(SlcState::CodecNegotiated, &mut reaction);
                    }
                    None => {
                        // counter-offer with everything we can do
                        let list = self
                            .our_codecs
                            .iter()
                            .map(|c| c.id().to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        reaction.replies.push(At::set("+BAC", list));
                    }
                }
            }
            (AtType::Resp, "+VGM") => {
                self.mic_gain = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(self.mic_gain);
                reaction.events.push(LinkEvent::MicGain(self.mic_gain));
            }
            (AtType::Resp, "+VGS") => {
                self.spk_gain = at.value.as_deref().unwrap_or("0").trim().parse().unwrap_or(self.spk_gain);
                reaction.events.push(LinkEvent::SpeakerGain(self.spk_gain));
            }
            (AtType::Resp, "") if at.is_result("OK") => {
                let next = match self.state {
                    SlcState::Disconnected => SlcState::BrsfSet,
                    SlcState::BrsfSet => SlcState::BacSet,
                    SlcState::BacSet => SlcState::CindTest,
                    SlcState::CindTest => SlcState::CindGet,
                    SlcState::CindGet => SlcState::SlcConnected,
                    state => state,
                };
                if next == SlcState::SlcConnected && self.state == SlcState::CindGet {
                    self.advance(SlcState::CmerSet, &mut reaction);
                }
                self.advance(next, &mut reaction);
            }
            (AtType::Resp, "") if at.is_result("ERROR") => {
                log::warn!("Peer rejected our command in state {}", self.state);
                self.state = SlcState::Disconnected;
            }
            (AtType::Resp, "") if at.is_result("RING") => {
                reaction.events.push(LinkEvent::Ring);
            }
            _ => log::debug!("Unhandled AT message: {at}"),
        }
        Ok(reaction)
    }
}

fn parse_ciev(value: &str) -> Option<(usize, u8)> {
    let (index, value) = value.split_once(',')?;
    Some((index.trim().parse().ok()?, value.trim().parse().ok()?))
}

fn parse_cind_declarations(value: &str) -> Vec<Indicator> {
    // ("service",(0-1)),("call",(0,1)),...
    let mut indicators = Vec::new();
    for part in value.split("(\"").skip(1) {
        let Some((name, rest)) = part.split_once('"') else { continue };
        let digits: Vec<u8> = rest
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        let (min, max) = match digits.as_slice() {
            [min, .., max] => (*min, *max),
            [only] => (*only, *only),
            [] => (0, 0),
        };
        indicators.push(Indicator::new(name, min, max, min));
    }
    indicators
}

/// Battery level in percent from an `AT+IPHONEACCEV` key-value list.
fn parse_iphoneaccev_battery(value: &str) -> Option<u8> {
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    let mut pairs = fields.iter().skip(1);
    while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
        if *key == "1" {
            let level: u8 = value.parse().ok()?;
            return Some((level + 1) * 10);
        }
    }
    None
}

/// Request sent to the link task to negotiate a voice codec.
struct CodecRequest {
    codec: HfpCodec,
    reply_tx: oneshot::Sender<Result<HfpCodec>>,
}

/// Handle of a running telephony link task, streaming its [LinkEvent]s.
#[pin_project]
pub struct LinkHandle {
    #[pin]
    events: UnboundedReceiverStream<LinkEvent>,
    codec_tx: mpsc::Sender<CodecRequest>,
    shutdown: Shutdown,
    join: JoinHandle<Result<()>>,
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("LinkHandle")
    }
}

impl futures::stream::Stream for LinkHandle {
    type Item = LinkEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.project().events.poll_next(cx)
    }
}

impl LinkHandle {
    /// Receives the next link event.
    pub async fn event(&mut self) -> Option<LinkEvent> {
        self.next().await
    }

    /// Negotiates a voice codec with the hands-free side (AG role).
    ///
    /// Resolves once the peer confirms with `AT+BCS`, or fails after the
    /// acknowledgment deadline.
    pub async fn select_codec(&self, codec: HfpCodec) -> Result<HfpCodec> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.codec_tx
            .send(CodecRequest { codec, reply_tx })
            .await
            .map_err(|_| Error::new(ErrorKind::LinkLost))?;
        match timeout(TIMEOUT_ACK, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(ErrorKind::LinkLost)),
            Err(_) => Err(Error::with_message(
                ErrorKind::NegotiationTimeout,
                "codec selection not confirmed in time",
            )),
        }
    }

    /// Stops the link task.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.join.await;
    }
}

/// Spawns the task driving one telephony link.
pub fn spawn_link<S>(stream: S, slc: Slc) -> LinkHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, events) = mpsc::unbounded_channel();
    let (codec_tx, codec_rx) = mpsc::channel(1);
    let (shutdown, token) = shutdown_pair();
    let join = tokio::spawn(async move {
        let result = run_link(stream, slc, event_tx, codec_rx, token).await;
        if let Err(err) = &result {
            log::warn!("Telephony link terminated: {err}");
        }
        result
    });
    LinkHandle { events: UnboundedReceiverStream::new(events), codec_tx, shutdown, join }
}

async fn run_link<S>(
    stream: S, mut slc: Slc, event_tx: mpsc::UnboundedSender<LinkEvent>,
    mut codec_rx: mpsc::Receiver<CodecRequest>, mut token: ShutdownToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = AtFramer::default();
    let mut read_buf = [0u8; 1024];
    let mut retries = 0usize;
    let mut pending_codec: Option<CodecRequest> = None;

    // the HF role opens the exchange
    if let Some(at) = slc.next_command() {
        writer.write_all(at.line().as_bytes()).await.map_err(Error::from)?;
    }

    loop {
        let connected = slc.is_connected();
        // bound the wait while the SLC is still being negotiated
        let read = async {
            if connected {
                Ok(reader.read(&mut read_buf).await)
            } else {
                timeout(TIMEOUT_IDLE, reader.read(&mut read_buf)).await
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,

            request = codec_rx.recv(), if pending_codec.is_none() => {
                let Some(request) = request else { break };
                match slc.propose_codec(request.codec) {
                    Ok(at) => {
                        writer.write_all(at.line().as_bytes()).await.map_err(Error::from)?;
                        pending_codec = Some(request);
                    }
                    Err(err) => {
                        let _ = request.reply_tx.send(Err(err));
                    }
                }
            }

            read = read => {
                let n = match read {
                    Ok(Ok(0)) => return Err(Error::new(ErrorKind::LinkLost)),
                    Ok(Ok(n)) => n,
                    Ok(Err(err)) => return Err(Error::from(err)),
                    Err(_elapsed) => {
                        retries += 1;
                        if retries > SLC_RETRIES {
                            return Err(Error::with_message(
                                ErrorKind::NegotiationTimeout,
                                format!("SLC stuck in state {}", slc.state()),
                            ));
                        }
                        // re-issue the command for the current stage
                        if let Some(at) = slc.next_command() {
                            log::debug!("SLC retry {retries}: {at}");
                            writer.write_all(at.line().as_bytes()).await.map_err(Error::from)?;
                        }
                        continue;
                    }
                };

                for line in framer.push(&read_buf[..n]) {
                    let at = match At::parse(&line) {
                        Ok(at) => at,
                        Err(err) => {
                            log::debug!("Ignoring unparsable AT line {line:?}: {err}");
                            continue;
                        }
                    };
                    log::trace!("SLC {} <- {at}", slc.role());

                    let before = slc.state();
                    let reaction = slc.handle(&at)?;
                    for reply in &reaction.replies {
                        writer.write_all(reply.line().as_bytes()).await.map_err(Error::from)?;
                    }
                    for event in reaction.events {
                        if let LinkEvent::CodecSelected(codec) = &event {
                            if let Some(request) = pending_codec.take() {
                                let _ = request.reply_tx.send(Ok(*codec));
                            }
                        }
                        let _ = event_tx.send(event);
                    }

                    if slc.state() != before {
                        retries = 0;
                        if let Some(at) = slc.next_command() {
                            writer.write_all(at.line().as_bytes()).await.map_err(Error::from)?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Splits a byte stream into AT lines across read boundaries.
#[derive(Debug, Default)]
struct AtFramer {
    acc: Vec<u8>,
}

impl AtFramer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    if !self.acc.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.acc).into_owned());
                        self.acc.clear();
                    }
                }
                _ => self.acc.push(byte),
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn framer_splits_across_boundaries() {
        let mut framer = AtFramer::default();
        assert!(framer.push(b"AT+BR").is_empty());
        assert_eq!(framer.push(b"SF=59\r\r\nOK\r\n"), vec!["AT+BRSF=59".to_string(), "OK".to_string()]);
    }

    #[test]
    fn cind_declaration_parsing() {
        let indicators =
            parse_cind_declarations("(\"service\",(0-1)),(\"call\",(0,1)),(\"callsetup\",(0-3))");
        assert_eq!(indicators.len(), 3);
        assert_eq!(indicators[0].name, "service");
        assert_eq!((indicators[2].min, indicators[2].max), (0, 3));
    }

    #[test]
    fn xapl_exchange_reports_features() {
        let mut ag = Slc::new_ag(vec![HfpCodec::Cvsd]);
        let r = ag.handle(&At::set("+XAPL", "05AC-1000-0100,10")).unwrap();
        assert!(r.events.contains(&LinkEvent::Xapl(10)));
        assert_eq!(r.replies[0], At::resp("+XAPL", "BlueAudio,6"));
        assert!(r.replies[1].is_result("OK"));
    }

    #[test]
    fn iphoneaccev_battery_parsing() {
        // key 1 = battery, value 0..9 maps to 10..100 percent
        assert_eq!(parse_iphoneaccev_battery("2,1,3,2,0"), Some(40));
        assert_eq!(parse_iphoneaccev_battery("1,2,0"), None);
    }

    #[test]
    fn ag_machine_walks_the_slc_states() {
        let mut ag = Slc::new_ag(vec![HfpCodec::Cvsd, HfpCodec::Msbc]);
        assert_eq!(ag.state(), SlcState::Disconnected);

        let r = ag.handle(&At::set("+BRSF", "895")).unwrap();
        assert_eq!(ag.state(), SlcState::BrsfSet);
        assert_eq!(r.replies.len(), 2);
        assert!(r.replies[1].is_result("OK"));
        assert_eq!(ag.peer_features(), 895);

        ag.handle(&At::set("+BAC", "1,2")).unwrap();
        assert_eq!(ag.state(), SlcState::BacSet);

        let r = ag.handle(&At::test("+CIND")).unwrap();
        assert!(r.replies[0].value.as_deref().unwrap().contains("\"battchg\""));
        assert_eq!(ag.state(), SlcState::CindTest);

        ag.handle(&At::get("+CIND")).unwrap();
        assert_eq!(ag.state(), SlcState::CindGet);

        let r = ag.handle(&At::set("+CMER", "3,0,0,1")).unwrap();
        assert_eq!(ag.state(), SlcState::SlcConnected);
        assert!(r.events.contains(&LinkEvent::SlcConnected));
    }

    #[test]
    fn ag_codec_proposal_round_trip() {
        let mut ag = Slc::new_ag(vec![HfpCodec::Cvsd, HfpCodec::Msbc]);
        // proposal before the SLC is refused
        assert_eq!(ag.propose_codec(HfpCodec::Msbc).unwrap_err().kind, ErrorKind::NotReady);

        ag.handle(&At::set("+BRSF", "895")).unwrap();
        ag.handle(&At::set("+BAC", "1,2")).unwrap();
        ag.handle(&At::test("+CIND")).unwrap();
        ag.handle(&At::get("+CIND")).unwrap();
        ag.handle(&At::set("+CMER", "3,0,0,1")).unwrap();

        // a codec outside the hands-free mask is refused
        assert_eq!(ag.propose_codec(HfpCodec::Lc3Swb).unwrap_err().kind, ErrorKind::NotSupported);

        let at = ag.propose_codec(HfpCodec::Msbc).unwrap();
        assert_eq!(at, At::resp("+BCS", "2"));
        let r = ag.handle(&At::set("+BCS", "2")).unwrap();
        assert_eq!(ag.selected_codec(), Some(HfpCodec::Msbc));
        assert_eq!(ag.state(), SlcState::CodecNegotiated);
        assert!(r.events.contains(&LinkEvent::CodecSelected(HfpCodec::Msbc)));
    }

    #[test]
    fn hf_accepts_gateway_codec_proposal() {
        let mut hf = Slc::new_hf(vec![HfpCodec::Cvsd, HfpCodec::Msbc]);
        let r = hf.handle(&At::resp("+BCS", "2")).unwrap();
        assert_eq!(r.replies[0], At::set("+BCS", "2"));
        assert_eq!(hf.selected_codec(), Some(HfpCodec::Msbc));

        // an unsupported proposal is countered with our codec list
        let mut hf = Slc::new_hf(vec![HfpCodec::Cvsd]);
        let r = hf.handle(&At::resp("+BCS", "3")).unwrap();
        assert_eq!(r.replies[0], At::set("+BAC", "1"));
        assert_eq!(hf.selected_codec(), None);
    }

    #[tokio::test]
    async fn scripted_exchange_reaches_slc_connected() {
        let (local, mut remote) = duplex(4096);
        let mut handle = spawn_link(local, Slc::new_hf(vec![HfpCodec::Cvsd, HfpCodec::Msbc]));

        // act as the scripted audio gateway on the remote side
        let script = tokio::spawn(async move {
            let mut framer = AtFramer::default();
            let mut buf = [0u8; 512];
            loop {
                let n = remote.read(&mut buf).await.unwrap();
                for line in framer.push(&buf[..n]) {
                    let at = At::parse(&line).unwrap();
                    let reply = match (at.ty, at.command.as_str()) {
                        (AtType::CmdSet, "+BRSF") => "\r\n+BRSF: 1544\r\n\r\nOK\r\n",
                        (AtType::CmdSet, "+BAC") => "\r\nOK\r\n",
                        (AtType::CmdTest, "+CIND") => {
                            "\r\n+CIND: (\"service\",(0-1)),(\"call\",(0,1))\r\n\r\nOK\r\n"
                        }
                        (AtType::CmdGet, "+CIND") => "\r\n+CIND: 1,0\r\n\r\nOK\r\n",
                        (AtType::CmdSet, "+CMER") => "\r\nOK\r\n",
                        _ => continue,
                    };
                    remote.write_all(reply.as_bytes()).await.unwrap();
                    if at.command == "+CMER" {
                        return;
                    }
                }
            }
        });

        let event = tokio::time::timeout(TIMEOUT_ACK * (SLC_RETRIES as u32 + 1), handle.event())
            .await
            .expect("SLC did not converge within the retry budget");
        assert_eq!(event, Some(LinkEvent::SlcConnected));
        script.await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn unresponsive_peer_exhausts_retry_budget() {
        let (local, remote) = duplex(4096);
        let handle = spawn_link(local, Slc::new_hf(vec![HfpCodec::Cvsd]));
        // never answer; keep the remote end open
        let result = tokio::time::timeout(TIMEOUT_IDLE * (SLC_RETRIES as u32 + 2), handle.join)
            .await
            .unwrap();
        drop(remote);
        assert_eq!(result.unwrap().unwrap_err().kind, ErrorKind::NegotiationTimeout);
    }
}
