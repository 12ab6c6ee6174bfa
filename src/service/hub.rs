//! # Hub Session
//!
//! The live connection to an ADC hub, from login to close.
//!
//! [`HubSession::connect`] logs in with [`HubHandshake`], then splits the
//! connection in two tasks:
//! - a **writer** draining an `mpsc` queue of outbound messages
//! - a **reader** that owns all session tables (peers, searches, pending
//!   peer connects) and is driven by hub traffic and by control requests
//!   from [`HubSession`] and its [`HubConnector`]s
//!
//! Session state is published through a `watch` channel so every handle sees
//! a close as soon as the reader does.
//!
//! ## Routing
//! - `BINF`/`IQUI` keep the peer table current. Our own `IQUI` closes the
//!   session.
//! - `DRES` goes to the search named by its `TO` token, if it matches that
//!   search.
//! - `DCTM` completes the pending `DRCM` with the same token.
//! - A fatal `ISTA` closes the session.
//! - Every inbound message is offered to [`HubSession::subscribe`] receivers.
//!
//! ## Backpressure
//! The reader never waits on a search's result channel. When a channel is
//! full its results queue in hub order, up to one channel's capacity, and
//! are handed over as room appears. Past that, results are dropped with a
//! warning. Peer connects and new searches are served throughout.
//!
//! ## Usage
//! ```rust,no_run
//! # use adc_client::{AdcConfig, HubEndpoint, HubSession, Identifier, Search};
//! # use rand::{rngs::StdRng, SeedableRng};
//! # async fn demo() -> adc_client::Result<()> {
//! let config = AdcConfig::default();
//! let endpoint = HubEndpoint::parse("adc://hub.example.net:411")?;
//! let pid = Identifier::private(vec![7u8; 24]);
//! let session = HubSession::connect(pid, &endpoint, &config.hub, StdRng::from_os_rng()).await?;
//!
//! let (tx, mut results) = tokio::sync::mpsc::channel(16);
//! let mut search = Search::new(&mut StdRng::from_os_rng());
//! search.add_include("ubuntu").set_result_channel(tx);
//! session.search(search).await?;
//! while let Some(result) = results.recv().await {
//!     println!("{result}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{DownloadSettings, HubConfig};
use crate::core::codec::AdcCodec;
use crate::core::fields::FieldMap;
use crate::core::identifier::Identifier;
use crate::core::message::{Message, MessageType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{HubHandshake, LocalIdentity, LoggedIn, SessionState};
use crate::protocol::peer::{connect_request, ConnectReply};
use crate::protocol::peers::PeerTable;
use crate::protocol::search::{new_token, Search, SearchResult};
use crate::protocol::status::{Severity, Status};
use crate::service::download::PeerConnector;
use crate::service::peer::{PeerConnection, PeerOptions};
use crate::transport::{self, BoxedStream, HubEndpoint};
use crate::utils::timeout::with_timeout_error;

type HubFramed = Framed<BoxedStream, AdcCodec>;

const EVENT_CAPACITY: usize = 256;

/// Where to reach a peer that agreed to a connection.
#[derive(Debug, Clone)]
struct PeerTarget {
    addr: SocketAddr,
    token: String,
}

struct PendingConnect {
    peer: Identifier,
    reply: oneshot::Sender<Result<PeerTarget>>,
}

enum Control {
    Search {
        search: Search,
        done: oneshot::Sender<Result<()>>,
    },
    Connect {
        peer: Identifier,
        reply: oneshot::Sender<Result<PeerTarget>>,
    },
    Close,
}

/// Handle to a logged-in hub session.
pub struct HubSession {
    sid: Identifier,
    cid: Identifier,
    hub_info: FieldMap,
    outbound: mpsc::Sender<Message>,
    control: mpsc::Sender<Control>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<Message>,
    max_line_length: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl HubSession {
    /// Connect, log in and start the session tasks.
    ///
    /// Nick and password from the URL take precedence over `config`. `rng`
    /// supplies connection tokens for the lifetime of the session.
    #[instrument(skip(pid, endpoint, config, rng), fields(hub = %endpoint.address()))]
    pub async fn connect<R>(
        pid: Identifier,
        endpoint: &HubEndpoint,
        config: &HubConfig,
        rng: R,
    ) -> Result<Self>
    where
        R: RngCore + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let stream = transport::connect_hub(endpoint, config.connect_timeout).await?;
        advance(&state_tx, SessionState::Handshaking)?;

        let identity = LocalIdentity::new(pid, endpoint.nick().unwrap_or(config.nick.as_str()))
            .with_description(config.description.clone())
            .with_password(
                endpoint
                    .password()
                    .map(str::to_string)
                    .or_else(|| config.password.clone()),
            );

        let mut framed = Framed::new(stream, AdcCodec::new(config.max_line_length));
        let logged_in = match with_timeout_error(
            login(&mut framed, HubHandshake::new(identity)),
            config.handshake_timeout,
        )
        .await
        {
            Ok(logged_in) => logged_in,
            Err(e) => {
                let _ = state_tx.send(SessionState::Closed);
                return Err(e);
            }
        };
        advance(&state_tx, SessionState::Ready)?;

        let LoggedIn {
            identity,
            sid,
            hub_info,
            peers,
            ..
        } = logged_in;
        info!(%sid, users = peers.len(), "hub session ready");

        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue);
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let writer = tokio::spawn(write_loop(sink, outbound_rx, state_rx.clone()));
        let reader = tokio::spawn(
            Reader {
                sid: sid.clone(),
                peers,
                searches: HashMap::new(),
                queued: HashMap::new(),
                pending: HashMap::new(),
                outbound: outbound_tx.clone(),
                events: events.clone(),
                state: state_tx,
                rng,
            }
            .run(stream, control_rx),
        );

        Ok(Self {
            sid,
            cid: identity.cid,
            hub_info,
            outbound: outbound_tx,
            control: control_tx,
            state: state_rx,
            events,
            max_line_length: config.max_line_length,
            reader,
            writer,
        })
    }

    pub fn sid(&self) -> &Identifier {
        &self.sid
    }

    pub fn cid(&self) -> &Identifier {
        &self.cid
    }

    /// Hub `IINF` fields gathered during login.
    pub fn hub_info(&self) -> &FieldMap {
        &self.hub_info
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_closed() {
            Err(ProtocolError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Queue a message for the hub.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.ensure_open()?;
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// Register `search` and broadcast it. Results that match it are pushed
    /// to its result channel.
    pub async fn search(&self, search: Search) -> Result<()> {
        if search.result_channel().is_none() {
            return Err(ProtocolError::InvalidRequest(
                constants::ERR_NO_RESULT_CHANNEL,
            ));
        }
        self.ensure_open()?;
        let (done, ack) = oneshot::channel();
        self.control
            .send(Control::Search { search, done })
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        ack.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    /// Every message the hub sends from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Peer connector for a download dispatcher.
    pub fn connector(&self, settings: &DownloadSettings) -> HubConnector {
        HubConnector {
            control: self.control.clone(),
            cid: self.cid.clone(),
            connect_timeout: settings.peer_connect_timeout,
            options: PeerOptions {
                compression: settings.compress,
                max_line_length: self.max_line_length,
                idle_timeout: settings.transfer_idle_timeout,
            },
        }
    }

    /// Close the session. Pending searches and connects are dropped.
    pub async fn close(&self) {
        let _ = self.control.send(Control::Close).await;
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_closed()).await;
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> Result<()> {
    let mut current = *state.borrow();
    current.transition(next)?;
    let _ = state.send(current);
    Ok(())
}

async fn login(framed: &mut HubFramed, mut handshake: HubHandshake) -> Result<LoggedIn> {
    framed.send(handshake.start()).await?;
    while !handshake.is_complete() {
        let msg = match framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(ProtocolError::MalformedMessage(e))) => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "malformed line during login: {e}"
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ProtocolError::ConnectionError(
                    constants::ERR_HUB_CLOSED.into(),
                ))
            }
        };
        trace!(%msg, "hub ->");
        if let Some(reply) = handshake.on_message(&msg)? {
            framed.send(reply).await?;
        }
    }
    handshake.finish()
}

async fn write_loop(
    mut sink: SplitSink<HubFramed, Message>,
    mut outbound: mpsc::Receiver<Message>,
    mut state: watch::Receiver<SessionState>,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                trace!(%msg, "hub <-");
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "hub write failed");
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_closed() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Results waiting for room in their search's channel.
type Queue = VecDeque<SearchResult>;

struct Reader<R> {
    sid: Identifier,
    peers: PeerTable,
    searches: HashMap<String, Search>,
    /// At most one channel's worth of results per search.
    queued: HashMap<String, Queue>,
    pending: HashMap<String, PendingConnect>,
    outbound: mpsc::Sender<Message>,
    events: broadcast::Sender<Message>,
    state: watch::Sender<SessionState>,
    rng: R,
}

impl<R: RngCore + Send> Reader<R> {
    async fn run(mut self, mut stream: SplitStream<HubFramed>, mut control: mpsc::Receiver<Control>) {
        loop {
            let backlog = self.backlog();
            let keep_going = tokio::select! {
                permit = reserve(backlog.as_ref().map(|(_, tx)| tx.clone())), if backlog.is_some() => {
                    if let Some((token, _)) = backlog {
                        self.on_room(token, permit);
                    }
                    true
                }
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => self.on_hub_message(msg).await,
                    Some(Err(ProtocolError::MalformedMessage(e))) => {
                        warn!(error = %e, "dropping malformed hub line");
                        true
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "hub connection failed");
                        false
                    }
                    None => {
                        info!("{}", constants::ERR_HUB_CLOSED);
                        false
                    }
                },
                cmd = control.recv() => match cmd {
                    Some(cmd) => self.on_control(cmd).await,
                    None => false,
                },
            };
            if !keep_going {
                break;
            }
        }
        let _ = self.state.send(SessionState::Closed);
        debug!(
            searches = self.searches.len(),
            queued = self.queued.values().map(VecDeque::len).sum::<usize>(),
            pending = self.pending.len(),
            "hub session closed"
        );
    }

    /// A search with results waiting, and the channel they go to.
    fn backlog(&self) -> Option<(String, mpsc::Sender<SearchResult>)> {
        self.queued.iter().find_map(|(token, queue)| {
            if queue.is_empty() {
                return None;
            }
            let tx = self.searches.get(token)?.result_channel()?.clone();
            Some((token.clone(), tx))
        })
    }

    fn on_room(
        &mut self,
        token: String,
        permit: std::result::Result<OwnedPermit<SearchResult>, SendError<()>>,
    ) {
        let Ok(permit) = permit else {
            self.drop_search(&token);
            return;
        };
        let Some(queue) = self.queued.get_mut(&token) else {
            return;
        };
        if let Some(result) = queue.pop_front() {
            permit.send(result);
        }
        if queue.is_empty() {
            self.queued.remove(&token);
        }
    }

    fn drop_search(&mut self, token: &str) {
        debug!(%token, "search consumer gone, dropping search");
        self.searches.remove(token);
        self.queued.remove(token);
    }

    async fn on_control(&mut self, cmd: Control) -> bool {
        match cmd {
            Control::Search { search, done } => {
                let msg = search.to_message(&self.sid);
                debug!(token = search.token(), "registering search");
                self.searches.insert(search.token().to_string(), search);
                let sent = self
                    .outbound
                    .send(msg)
                    .await
                    .map_err(|_| ProtocolError::SessionClosed);
                let _ = done.send(sent);
                true
            }
            Control::Connect { peer, reply } => {
                self.pending.retain(|_, p| !p.reply.is_closed());
                match self.peers.get(peer.as_str()) {
                    Some(info) if info.ipv4().is_some() => {}
                    _ => {
                        let _ = reply.send(Err(ProtocolError::ConnectionError(format!(
                            "{}: {peer}",
                            constants::ERR_PEER_NO_ADDRESS
                        ))));
                        return true;
                    }
                }
                let token = new_token(&mut self.rng);
                let msg = connect_request(&self.sid, &peer, &token);
                if self.outbound.send(msg).await.is_err() {
                    let _ = reply.send(Err(ProtocolError::SessionClosed));
                    return false;
                }
                debug!(%peer, %token, "asked peer to connect");
                self.pending.insert(token, PendingConnect { peer, reply });
                true
            }
            Control::Close => false,
        }
    }

    async fn on_hub_message(&mut self, msg: Message) -> bool {
        trace!(%msg, "hub ->");
        let _ = self.events.send(msg.clone());

        match (msg.kind(), msg.command()) {
            (MessageType::Broadcast, "INF") => {
                if let Err(e) = self.peers.apply_inf(&msg) {
                    debug!(error = %e, "ignoring bad INF");
                }
            }
            (MessageType::Info, "QUI") => {
                let sid = msg.param(0).unwrap_or_default();
                if sid == self.sid.as_str() {
                    warn!(%msg, "hub disconnected us");
                    return false;
                }
                self.peers.remove(sid);
            }
            (MessageType::Direct | MessageType::Echo, "RES") => self.on_result(&msg),
            (MessageType::Direct | MessageType::Echo, "CTM") => self.on_connect_reply(&msg),
            (MessageType::Info, "STA") => match Status::from_message(&msg) {
                Ok(status) if status.is_fatal() => {
                    warn!(%status, "fatal hub status");
                    return false;
                }
                Ok(status) if status.severity() == Severity::Recoverable => {
                    warn!(%status, "hub status")
                }
                Ok(status) => debug!(%status, "hub status"),
                Err(e) => debug!(error = %e, "ignoring bad STA"),
            },
            (MessageType::Direct | MessageType::Echo, "STA") => match Status::from_message(&msg) {
                Ok(status) => info!(from = msg.param(0), %status, "peer status"),
                Err(e) => debug!(error = %e, "ignoring bad STA"),
            },
            _ => {}
        }
        true
    }

    fn on_result(&mut self, msg: &Message) {
        let result = match SearchResult::from_message(msg, &self.peers) {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "ignoring bad RES");
                return;
            }
        };
        let Some(token) = result.token.clone() else {
            trace!(%result, "result without a token");
            return;
        };
        let Some(search) = self.searches.get(&token) else {
            trace!(%token, "result for an unknown search");
            return;
        };
        if !search.matches(&result) {
            trace!(%result, "result does not match its search");
            return;
        }
        let Some(results) = search.result_channel().cloned() else {
            return;
        };

        debug!(%result, "routing result");
        // Keep hub order: once results are queued, later ones queue behind.
        let queue = self.queued.entry(token.clone()).or_default();
        if queue.is_empty() {
            match results.try_send(result) {
                Ok(()) => {}
                Err(TrySendError::Full(result)) => queue.push_back(result),
                Err(TrySendError::Closed(_)) => self.drop_search(&token),
            }
        } else if queue.len() < results.max_capacity() {
            queue.push_back(result);
        } else {
            warn!(%token, %result, "search consumer is behind, dropping result");
        }
    }

    fn on_connect_reply(&mut self, msg: &Message) {
        let reply = match ConnectReply::from_message(msg) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "ignoring bad CTM");
                return;
            }
        };
        let Some(pending) = self.pending.remove(&reply.token) else {
            debug!(token = %reply.token, "CTM for an unknown token");
            return;
        };
        if pending.peer != reply.peer {
            let _ = pending.reply.send(Err(ProtocolError::ProtocolViolation(format!(
                "CTM from {} for a connection requested from {}",
                reply.peer, pending.peer
            ))));
            return;
        }
        let target = self
            .peers
            .get(reply.peer.as_str())
            .and_then(|info| info.ipv4())
            .map(|ip| PeerTarget {
                addr: SocketAddr::new(ip.into(), reply.port),
                token: reply.token.clone(),
            })
            .ok_or_else(|| {
                ProtocolError::ConnectionError(format!(
                    "{}: {}",
                    constants::ERR_PEER_NO_ADDRESS,
                    reply.peer
                ))
            });
        let _ = pending.reply.send(target);
    }
}

async fn reserve(
    tx: Option<mpsc::Sender<SearchResult>>,
) -> std::result::Result<OwnedPermit<SearchResult>, SendError<()>> {
    match tx {
        Some(tx) => tx.reserve_owned().await,
        None => std::future::pending().await,
    }
}

/// Opens peer connections by asking through the hub with `RCM`.
#[derive(Clone)]
pub struct HubConnector {
    control: mpsc::Sender<Control>,
    cid: Identifier,
    connect_timeout: Duration,
    options: PeerOptions,
}

impl PeerConnector for HubConnector {
    #[instrument(skip(self, result), fields(peer = %result.source))]
    async fn open(&self, result: &SearchResult) -> Result<PeerConnection> {
        let (reply, target) = oneshot::channel();
        self.control
            .send(Control::Connect {
                peer: result.source.clone(),
                reply,
            })
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;

        let target = with_timeout_error(
            async { target.await.map_err(|_| ProtocolError::SessionClosed)? },
            self.connect_timeout,
        )
        .await?;
        debug!(addr = %target.addr, "peer accepted connection request");

        let stream = transport::connect_peer(target.addr, self.connect_timeout).await?;
        PeerConnection::handshake(stream, &self.cid, &target.token, &self.options).await
    }
}
