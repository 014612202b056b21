//! The secure stream adapter.
//!
//! A [`DtlsSocket`] is a handle. The session itself lives in a driver task
//! that exclusively owns the engine and the transport and processes, one at
//! a time, handle commands, inbound datagrams and engine timers. Every
//! engine call and every transport send happens on that task, so datagrams
//! are handled in delivery order and at most one write is ever in flight.

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::engine::{Engine, EngineBuilder, EngineOutput, EngineOutputs, Session};
use crate::engine::PEER_CLOSE_NOTIFY;
use crate::keys::Credentials;
use crate::transport::{Transport, UdpTransport};
use crate::{Config, Error, Event, State};

/// Payload of the liveness probe datagram.
const PING: [u8; 1] = [0x70];

/// A secure, ordered byte stream to one peer.
///
/// Data written is encrypted by the engine and sent as datagrams; decrypted
/// data arrives as [`Event::Data`] from [`DtlsSocket::next_event`].
///
/// At most [`Config::write_queue_limit`] writes are outstanding at a time.
/// [`DtlsSocket::is_ready`] and [`DtlsSocket::ready`] tell when another one
/// is accepted.
///
/// Dropping the handle ends the session as if [`DtlsSocket::end`] was called.
#[derive(Debug)]
pub struct DtlsSocket {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    write_permits: Arc<Semaphore>,
    peer: SocketAddr,
    local_addr: SocketAddr,
}

impl DtlsSocket {
    /// Open a session over a freshly bound UDP socket.
    ///
    /// Key material is read and decoded before anything is bound; a bad key
    /// fails here. The handshake starts on the driver task after this
    /// returns.
    pub async fn connect<B: EngineBuilder>(config: Config, builder: B) -> Result<Self, Error> {
        let peer = resolve(&config).await?;
        let credentials = Credentials::load(config.key(), config.peer_public_key())?;

        let bind = config.bind_addr().unwrap_or_else(|| wildcard(peer));
        let transport = UdpTransport::bind(bind)
            .await?
            .with_max_datagram_size(config.max_datagram_size());

        Self::start(&config, peer, Box::new(transport), credentials, builder)
    }

    /// Open a session over an existing transport.
    ///
    /// The socket takes exclusive ownership of `transport` and closes it when
    /// the session ends.
    pub async fn with_transport<T, B>(config: Config, transport: T, builder: B) -> Result<Self, Error>
    where
        T: Transport + 'static,
        B: EngineBuilder,
    {
        let peer = resolve(&config).await?;
        let credentials = Credentials::load(config.key(), config.peer_public_key())?;

        Self::start(&config, peer, Box::new(transport), credentials, builder)
    }

    fn start<B: EngineBuilder>(
        config: &Config,
        peer: SocketAddr,
        transport: Box<dyn Transport>,
        credentials: Credentials,
        builder: B,
    ) -> Result<Self, Error> {
        let local_addr = transport.local_addr()?;
        debug!(
            "Session {} -> {} (peer key {})",
            local_addr,
            peer,
            credentials.peer_fingerprint()
        );

        let engine = builder.build(credentials, config.debug())?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            peer,
            verbose: config.debug(),
            state: State::Connecting,
            transport: Some(transport),
            engine: Some(Box::new(engine)),
            accepting: true,
            queued: VecDeque::new(),
            in_flight: WriteSlot::default(),
            had_error: false,
            notify_on_close: false,
            commands: commands_rx,
            commands_open: true,
            events: Some(events_tx),
        };

        tokio::spawn(driver.run());

        Ok(DtlsSocket {
            commands: commands_tx,
            events: events_rx,
            write_permits: Arc::new(Semaphore::new(config.write_queue_limit())),
            peer,
            local_addr,
        })
    }

    /// Queue application data for encryption and sending.
    ///
    /// Writes are sent one at a time in call order; writes issued before the
    /// handshake completes wait for it. The returned future resolves once the
    /// datagrams for this write were handed to the transport and the sends
    /// completed. Dropping it does not cancel the write.
    ///
    /// When the write queue is full the completion fails right away with
    /// [`Error::WouldBlock`] and nothing is queued.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> WriteCompletion {
        let (done, rx) = oneshot::channel();

        let Ok(permit) = self.write_permits.clone().try_acquire_owned() else {
            trace!("Write queue full");
            let _ = done.send(Err(Error::WouldBlock));
            return WriteCompletion { rx };
        };

        let write = PendingWrite {
            data: data.into(),
            done,
            permit,
        };
        // A stopped driver drops the write, and with it `done`.
        let _ = self.commands.send(Command::Write(write));
        WriteCompletion { rx }
    }

    /// Whether [`DtlsSocket::write`] would accept another write now.
    pub fn is_ready(&self) -> bool {
        self.write_permits.available_permits() > 0
    }

    /// Wait until [`DtlsSocket::write`] accepts another write.
    pub async fn ready(&self) {
        // The semaphore is never closed.
        if let Ok(permit) = self.write_permits.acquire().await {
            drop(permit);
        }
    }

    /// Gracefully end the session, sending a close-notify to the peer.
    ///
    /// Safe to call any number of times.
    pub fn end(&self) {
        let _ = self.commands.send(Command::End);
    }

    /// Send a one byte liveness probe outside the DTLS session.
    pub fn ping(&self) {
        let _ = self.commands.send(Command::Ping);
    }

    /// The negotiated session, if the engine has one and is still alive.
    pub async fn session(&self) -> Option<Session> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Session(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Records sent so far, while the engine is alive.
    pub async fn out_counter(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::OutCounter(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Next session event. `None` after [`Event::Closed`] was delivered.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Local address of the transport.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address datagrams are sent to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Completion of one [`DtlsSocket::write`].
#[derive(Debug)]
pub struct WriteCompletion {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Future for WriteCompletion {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Closed)))
    }
}

#[derive(Debug)]
enum Command {
    Write(PendingWrite),
    End,
    Ping,
    Session(oneshot::Sender<Option<Session>>),
    OutCounter(oneshot::Sender<Option<u64>>),
}

/// A write accepted by the handle. Holds its queue slot until dropped.
#[derive(Debug)]
struct PendingWrite {
    data: Vec<u8>,
    done: oneshot::Sender<Result<(), Error>>,
    permit: OwnedSemaphorePermit,
}

impl PendingWrite {
    fn resolve(self, result: Result<(), Error>) {
        let _ = self.done.send(result);
    }
}

/// The one write currently being encrypted and sent.
///
/// Empty or full; a full slot is emptied exactly once.
#[derive(Debug, Default)]
struct WriteSlot(Option<oneshot::Sender<Result<(), Error>>>);

impl WriteSlot {
    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn fill(&mut self, done: oneshot::Sender<Result<(), Error>>) {
        debug_assert!(self.0.is_none(), "write slot already full");
        self.0 = Some(done);
    }

    fn take(&mut self) -> Option<oneshot::Sender<Result<(), Error>>> {
        self.0.take()
    }

    /// Resolve the pending write, if any. Returns whether there was one.
    fn resolve(&mut self, result: Result<(), Error>) -> bool {
        match self.take() {
            Some(done) => {
                let _ = done.send(result);
                true
            }
            None => false,
        }
    }
}

struct Driver {
    peer: SocketAddr,
    verbose: bool,
    state: State,
    transport: Option<Box<dyn Transport>>,
    engine: Option<Box<dyn Engine>>,
    accepting: bool,
    queued: VecDeque<PendingWrite>,
    in_flight: WriteSlot,
    had_error: bool,
    notify_on_close: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl Driver {
    async fn run(mut self) {
        self.kick_off().await;

        while self.state != State::Closed {
            let deadline = self.engine.as_ref().and_then(|e| e.poll_timeout());

            tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All handles dropped");
                        self.commands_open = false;
                        self.end().await;
                    }
                },
                inbound = recv_inbound(&mut self.transport, self.accepting) => {
                    self.handle_inbound(inbound).await;
                }
                _ = sleep_until(deadline) => self.handle_timeout().await,
            }

            self.pump_writes().await;
        }

        trace!("Driver for {} stopped", self.peer);
    }

    fn set_state(&mut self, state: State) {
        if self.verbose {
            info!("{}: {} -> {}", self.peer, self.state, state);
        } else {
            debug!("{}: {} -> {}", self.peer, self.state, state);
        }
        self.state = state;
    }

    fn emit(&mut self, event: Event) {
        if let Some(events) = &self.events {
            // The handle may be gone; events are then simply dropped.
            let _ = events.send(event);
        }
    }

    async fn kick_off(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let mut out = EngineOutputs::new();
        engine.connect(&mut out);
        self.set_state(State::Handshaking);

        if let Err(e) = self.process(out).await {
            debug!("Handshake send failed: {}", e);
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Write(write) => {
                if self.state.is_ending() {
                    write.resolve(Err(Error::Closed));
                } else {
                    self.queued.push_back(write);
                }
            }
            Command::End => self.end().await,
            Command::Ping => {
                if let Some(transport) = self.transport.as_mut() {
                    if let Err(e) = transport.send_to(&PING, self.peer).await {
                        warn!("Liveness probe to {} failed: {}", self.peer, e);
                    }
                }
            }
            Command::Session(reply) => {
                let _ = reply.send(self.engine.as_ref().and_then(|e| e.session()));
            }
            Command::OutCounter(reply) => {
                let _ = reply.send(self.engine.as_ref().map(|e| e.out_counter()));
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: io::Result<Option<(Vec<u8>, SocketAddr)>>) {
        match inbound {
            Ok(Some((datagram, from))) => self.receive(datagram, from).await,
            Ok(None) => {
                debug!("Transport closed underneath the session");
                self.transport = None;
                self.teardown().await;
            }
            Err(e) => {
                warn!("Transport error: {}", e);
                self.had_error = true;
                self.emit(Event::Error(Error::Io(e)));
                self.teardown().await;
            }
        }
    }

    async fn receive(&mut self, datagram: Vec<u8>, from: SocketAddr) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        trace!("Datagram {} bytes from {}", datagram.len(), from);

        let mut out = EngineOutputs::new();
        let data = engine.receive_data(&datagram, &mut out);

        if let Err(e) = self.process_with_data(out, data).await {
            debug!("Send failed while handling inbound datagram: {}", e);
        }
    }

    /// Emit decrypted application data.
    ///
    /// `None` means the datagram carried no application data. Neither it nor
    /// an empty chunk means end of stream.
    fn deliver(&mut self, data: Option<Vec<u8>>) {
        match data {
            Some(data) if self.state.is_ending() => {
                trace!("Dropping {} bytes decrypted during teardown", data.len());
            }
            Some(data) if !data.is_empty() => self.emit(Event::Data(data)),
            _ => {}
        }
    }

    async fn handle_timeout(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let mut out = EngineOutputs::new();
        engine.handle_timeout(tokio::time::Instant::now().into_std(), &mut out);

        if let Err(e) = self.process(out).await {
            debug!("Retransmit failed: {}", e);
        }
    }

    /// Start queued writes, one at a time, while connected.
    async fn pump_writes(&mut self) {
        while self.state == State::Connected && self.in_flight.is_empty() {
            let Some(PendingWrite { data, done, permit }) = self.queued.pop_front() else {
                break;
            };
            self.in_flight.fill(done);

            let Some(engine) = self.engine.as_mut() else {
                self.in_flight.resolve(Err(Error::Closed));
                break;
            };
            let mut out = EngineOutputs::new();
            engine.send(&data, &mut out);
            trace!("Write of {} bytes gave {} outputs", data.len(), out.len());

            let result = self.process(out).await;
            // Already resolved if the engine failed during the write.
            self.in_flight.resolve(result);
            drop(permit);
        }
    }

    /// Act on engine outputs in order.
    ///
    /// Returns the first datagram send failure. Stops at the first engine
    /// error that ends the session.
    async fn process(&mut self, out: EngineOutputs) -> Result<(), Error> {
        self.process_with_data(out, None).await
    }

    /// Like [`Driver::process`], for outputs of a decrypt that also yielded
    /// `data`.
    ///
    /// The data is emitted after the handshake signal and before any engine
    /// error, so a close-notify or alert riding with the last record never
    /// swallows it.
    async fn process_with_data(
        &mut self,
        mut out: EngineOutputs,
        mut data: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let mut result = Ok(());

        while let Some(output) = out.pop() {
            match output {
                EngineOutput::Datagram(datagram) => {
                    if let Err(e) = self.send_datagram(&datagram).await {
                        if result.is_ok() {
                            result = Err(e);
                        } else {
                            debug!("Further send failure: {}", e);
                        }
                    }
                }
                EngineOutput::HandshakeComplete => self.handshake_complete(),
                EngineOutput::Error { code, message } => {
                    self.deliver(data.take());
                    self.engine_error(code, message).await;
                    if !out.is_empty() {
                        trace!("Dropping {} outputs after engine error", out.len());
                    }
                    break;
                }
            }
        }

        self.deliver(data);
        result
    }

    async fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), Error> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::NoTransport);
        };
        transport.send_to(datagram, self.peer).await?;
        Ok(())
    }

    fn handshake_complete(&mut self) {
        if self.state != State::Handshaking {
            debug!("Ignoring handshake complete in state {}", self.state);
            return;
        }
        self.set_state(State::Connected);
        self.emit(Event::Connected);
    }

    async fn engine_error(&mut self, code: i32, message: String) {
        if code == PEER_CLOSE_NOTIFY {
            debug!("Peer sent close notify");
            self.teardown().await;
            return;
        }

        warn!("Engine error {}: {}", code, message);
        self.had_error = true;

        // A pending write gets the error instead of the event stream.
        let err = Error::Engine { code, message };
        match self.in_flight.take() {
            Some(done) => {
                let _ = done.send(Err(err));
            }
            None => self.emit(Event::Error(err)),
        }

        self.teardown().await;
    }

    async fn end(&mut self) {
        self.notify_on_close = true;
        self.teardown().await;
    }

    /// Single convergence point for every shutdown trigger. Runs once.
    async fn teardown(&mut self) {
        if !self.state.can_end() {
            return;
        }
        self.set_state(State::Ending);
        self.accepting = false;
        self.emit(Event::End);

        for write in self.queued.drain(..) {
            write.resolve(Err(Error::Closed));
        }

        let mut out = EngineOutputs::new();
        let no_send = match self.engine.take() {
            Some(mut engine) => engine.close(&mut out),
            None => true,
        };

        if no_send || !self.notify_on_close {
            if !out.is_empty() {
                trace!("Discarding {} close outputs", out.len());
            }
            self.close_transport().await;
            return;
        }

        // The close-notify must be sent before the transport goes away.
        for output in out {
            if let EngineOutput::Datagram(datagram) = output {
                if let Err(e) = self.send_datagram(&datagram).await {
                    debug!("Close notify send failed: {}", e);
                }
            }
        }
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Transport close failed: {}", e);
            }
        }
        self.transport_closed();
    }

    fn transport_closed(&mut self) {
        self.set_state(State::Closed);
        let had_error = self.had_error;
        self.emit(Event::Closed { had_error });

        // Detach observers. Writes still in the command channel are dropped
        // with it and resolve as closed.
        self.events = None;
        self.commands.close();
    }
}

async fn recv_inbound(
    transport: &mut Option<Box<dyn Transport>>,
    accepting: bool,
) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
    match transport {
        Some(t) if accepting => t.recv().await,
        _ => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d.into()).await,
        None => pending().await,
    }
}

async fn resolve(config: &Config) -> Result<SocketAddr, Error> {
    let target = format!("{}:{}", config.host(), config.port());
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((config.host(), config.port()))
        .await
        .map_err(|_| Error::Resolve(target.clone()))?
        .collect();

    // Prefer IPv4 like a udp4 socket would.
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or(Error::Resolve(target))
}

fn wildcard(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_slot_resolves_once() {
        let mut slot = WriteSlot::default();
        assert!(slot.is_empty());

        let (tx, mut rx) = oneshot::channel();
        slot.fill(tx);
        assert!(!slot.is_empty());

        assert!(slot.resolve(Ok(())));
        assert!(!slot.resolve(Err(Error::Closed)));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test]
    async fn dropped_completion_sender_reads_as_closed() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let res = WriteCompletion { rx }.await;
        assert!(matches!(res, Err(Error::Closed)));
    }

    #[test]
    fn wildcard_matches_family() {
        let v4: SocketAddr = "10.0.0.1:5684".parse().unwrap();
        let v6: SocketAddr = "[::1]:5684".parse().unwrap();
        assert_eq!(wildcard(v4), "0.0.0.0:0".parse().unwrap());
        assert_eq!(wildcard(v6), "[::]:0".parse().unwrap());
    }

    #[tokio::test]
    async fn resolve_literal_address() {
        let config = Config::builder()
            .host("127.0.0.1")
            .port(5684)
            .key(vec![1])
            .peer_public_key(vec![2])
            .build()
            .unwrap();
        let addr = resolve(&config).await.unwrap();
        assert_eq!(addr, "127.0.0.1:5684".parse().unwrap());
    }
}
