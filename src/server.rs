//! Accept loop, per-connection sessions and the shutdown state machine.
//!
//! `Server::run` spawns two tasks: the accept loop, which admits connections and spawns one
//! session task per connection, and the error sink, which logs whatever the other tasks report.
//! `Server::kill` cancels the shared token, waits for every task within the configured budget and
//! force-closes whatever is still open after that.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use strum_macros::Display;
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};
use uuid::Uuid;

use crate::codec::TokenCodec;
use crate::commands::{Dispatcher, Handler};
use crate::config::Config;
use crate::connection::Connection;
use crate::registry::{Registration, Registry};
use crate::store::Store;
use crate::token::{EncodeError, ProtocolError};
use crate::Error;

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum State {
    Running,
    ShuttingDown,
    Stopped,
}

/// How a call to `Server::kill` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Every task finished within the shutdown timeout.
    Graceful,
    /// The timeout expired and this many connections were closed forcibly.
    Forced { connections: usize },
    /// Another call already shut the server down, or is doing so.
    AlreadyStopped,
}

/// Reasons a single session ends early. None of them affect other sessions or the server.
#[derive(Debug, ThisError)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] EncodeError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("response not written within {0:?}")]
    WriteTimeout(Duration),
    #[error("failed to dispatch command: {0}")]
    Dispatch(Error),
}

#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server is already running")]
    AlreadyStarted,
    #[error("server has been shut down")]
    NotRunning,
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("rejected connection from {addr}: max connections ({max}) reached")]
    AdmissionRejected { addr: SocketAddr, max: usize },
    #[error("connection {addr} failed: {source}")]
    Session {
        addr: SocketAddr,
        #[source]
        source: SessionError,
    },
    #[error("graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

pub struct Server {
    config: Config,
    local_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    /// Bound but `run` has not been called yet.
    Bound(TcpListener),
    Serving(Tasks),
    ShuttingDown,
    Stopped,
}

struct Tasks {
    accept: Option<JoinHandle<()>>,
    errors: Option<JoinHandle<()>>,
    // Never receives a value. Every session holds a sender and `recv` returns `None` once the
    // last one is dropped.
    sessions: mpsc::Receiver<()>,
}

impl Tasks {
    async fn join(&mut self) {
        if let Some(accept) = self.accept.as_mut() {
            if let Err(err) = accept.await {
                error!("accept loop panicked: {}", err);
            }
            self.accept = None;
        }

        let _ = self.sessions.recv().await;

        if let Some(errors) = self.errors.as_mut() {
            if let Err(err) = errors.await {
                error!("error sink panicked: {}", err);
            }
            self.errors = None;
        }
    }
}

impl Server {
    /// Binds the listener and sets up a fresh store behind the default command handler.
    pub async fn bind(config: Config) -> Result<Server, ServerError> {
        let handler = Handler::new(Store::new());
        Server::with_dispatcher(config, Arc::new(handler)).await
    }

    pub async fn with_dispatcher(
        config: Config,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Server, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: config.addr,
            source,
        };

        let listener = TcpListener::bind(config.addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("Redis server listening on {}", local_addr);

        Ok(Server {
            config,
            local_addr,
            dispatcher,
            registry: Arc::new(Registry::new()),
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Bound(listener)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently admitted.
    pub fn connections(&self) -> usize {
        self.registry.live()
    }

    pub fn state(&self) -> State {
        match *self.lifecycle() {
            Lifecycle::Bound(_) | Lifecycle::Serving(_) => State::Running,
            Lifecycle::ShuttingDown => State::ShuttingDown,
            Lifecycle::Stopped => State::Stopped,
        }
    }

    /// Starts the accept loop and the error sink and returns without waiting for them. Must be
    /// called from within a Tokio runtime.
    pub fn run(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle();

        let listener = match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Bound(listener) => listener,
            other => {
                let err = match other {
                    Lifecycle::Serving(_) => ServerError::AlreadyStarted,
                    _ => ServerError::NotRunning,
                };
                *lifecycle = other;
                return Err(err);
            }
        };

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (sessions_tx, sessions_rx) = mpsc::channel(1);

        let errors = tokio::spawn(report_errors(errors_rx));

        let acceptor = Acceptor {
            listener,
            config: self.config.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
            errors: errors_tx,
            sessions: sessions_tx,
        };
        let accept = tokio::spawn(acceptor.run());

        *lifecycle = Lifecycle::Serving(Tasks {
            accept: Some(accept),
            errors: Some(errors),
            sessions: sessions_rx,
        });

        Ok(())
    }

    /// Shuts the server down: stop accepting, let sessions wind down, and force-close whatever
    /// is still open once `shutdown_timeout` has passed.
    pub async fn kill(&self) -> Shutdown {
        let previous = mem::replace(&mut *self.lifecycle(), Lifecycle::ShuttingDown);

        let mut tasks = match previous {
            Lifecycle::Serving(tasks) => tasks,
            Lifecycle::Bound(listener) => {
                drop(listener);
                self.shutdown.cancel();
                *self.lifecycle() = Lifecycle::Stopped;
                info!("Server stopped before it started serving");
                return Shutdown::Graceful;
            }
            other => {
                *self.lifecycle() = other;
                return Shutdown::AlreadyStopped;
            }
        };

        info!(
            "Initiating graceful shutdown of {} connections...",
            self.registry.live()
        );
        self.shutdown.cancel();

        let timeout = self.config.shutdown_timeout;
        let outcome = match time::timeout(timeout, tasks.join()).await {
            Ok(()) => {
                info!("Graceful shutdown completed");
                Shutdown::Graceful
            }
            Err(_) => {
                warn!("{}, forcing connections closed", ServerError::ShutdownTimeout(timeout));
                let connections = self.registry.force_close_all();

                if time::timeout(timeout, tasks.join()).await.is_err() {
                    error!("Tasks still running after forcing connections closed");
                }
                Shutdown::Forced { connections }
            }
        };

        *self.lifecycle() = Lifecycle::Stopped;
        outcome
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Tasks of a server that was never killed still stop once it goes away.
        self.shutdown.cancel();
    }
}

/// State owned by the accept loop.
struct Acceptor {
    listener: TcpListener,
    config: Config,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    errors: mpsc::UnboundedSender<ServerError>,
    sessions: mpsc::Sender<()>,
}

impl Acceptor {
    async fn run(self) {
        info!("Accepting inbound connections");
        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, client_address)) => {
                    backoff = INITIAL_ACCEPT_BACKOFF;
                    self.admit(socket, client_address);
                }
                Err(err) => {
                    // Usually transient, such as running out of file descriptors.
                    let _ = self.errors.send(ServerError::Accept(err));
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }

        info!("Stopped accepting connections");
        // Dropping `self` closes the listening socket.
    }

    fn admit(&self, socket: TcpStream, client_address: SocketAddr) {
        let max = self.config.max_connections;
        if self.registry.is_full(max) {
            drop(socket);
            let _ = self.errors.send(ServerError::AdmissionRejected {
                addr: client_address,
                max,
            });
            return;
        }

        let id = Uuid::new_v4();
        let registration = self.registry.register(client_address, id);
        info!("Accepted connection from {:?}", client_address);

        let session = Session {
            connection: Connection::with_codec(
                socket,
                client_address,
                id,
                TokenCodec::new(self.config.max_frame_size),
            ),
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown: self.shutdown.clone(),
            write_timeout: self.config.write_timeout,
            errors: self.errors.clone(),
            registration,
            _done: self.sessions.clone(),
        };

        tokio::spawn(session.run());
    }
}

/// One client connection's request/response loop. Fields drop in order, so the socket is closed
/// before the registration is released.
struct Session {
    connection: Connection,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: CancellationToken,
    write_timeout: Duration,
    errors: mpsc::UnboundedSender<ServerError>,
    registration: Registration,
    _done: mpsc::Sender<()>,
}

impl Session {
    #[instrument(name = "connection", skip(self), fields(connection_id, client_address))]
    async fn run(mut self) {
        tracing::Span::current()
            .record("connection_id", tracing::field::display(self.connection.id))
            .record(
                "client_address",
                tracing::field::display(self.connection.client_address),
            );

        let force_close = self.registration.force_close().clone();
        let result = tokio::select! {
            result = self.serve() => result,
            _ = force_close.cancelled() => {
                warn!("Connection force-closed");
                return;
            }
        };

        match result {
            Ok(()) => info!("Connection closed"),
            Err(err) => {
                debug!("Connection closed with error: {}", err);
                let _ = self.errors.send(ServerError::Session {
                    addr: self.connection.client_address,
                    source: err,
                });
            }
        }
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            // Waiting for the next request is the only point where shutdown interrupts a
            // session. A request that has been read is answered before the session stops.
            let token = tokio::select! {
                token = self.connection.read_token() => token?,
                _ = self.shutdown.cancelled() => {
                    debug!("Shutting down idle connection");
                    return Ok(());
                }
            };

            let Some(token) = token else {
                return Ok(());
            };

            debug!("Received token from client: {}", token);
            let response = self
                .dispatcher
                .handle(token)
                .map_err(SessionError::Dispatch)?;
            debug!("Sending response to client: {}", response);

            time::timeout(self.write_timeout, self.connection.write_token(&response))
                .await
                .map_err(|_| SessionError::WriteTimeout(self.write_timeout))??;

            if self.shutdown.is_cancelled() {
                return Ok(());
            }
        }
    }
}

async fn report_errors(mut errors: mpsc::UnboundedReceiver<ServerError>) {
    // Runs until the accept loop and every session have dropped their senders.
    while let Some(err) = errors.recv().await {
        if level(&err) == Level::WARN {
            warn!("{}", err);
        } else {
            error!("{}", err);
        }
    }
}

/// Severity an error is reported with. Misbehaving or surplus clients are warnings, anything
/// that points at the server or its host is an error.
fn level(err: &ServerError) -> Level {
    match err {
        ServerError::AdmissionRejected { .. } => Level::WARN,
        ServerError::Session {
            source: SessionError::Protocol(_) | SessionError::Encode(_),
            ..
        } => Level::WARN,
        _ => Level::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        addr: SocketAddr,
        shutdown: CancellationToken,
        errors: mpsc::UnboundedReceiver<ServerError>,
        _sessions: mpsc::Receiver<()>,
    }

    impl Harness {
        /// Runs an accept loop whose error channel is read by the test instead of the sink.
        async fn start(max_connections: usize) -> Harness {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (errors_tx, errors) = mpsc::unbounded_channel();
            let (sessions_tx, sessions) = mpsc::channel(1);
            let shutdown = CancellationToken::new();

            let acceptor = Acceptor {
                listener,
                config: Config {
                    addr,
                    max_connections,
                    ..Config::default()
                },
                dispatcher: Arc::new(Handler::default()),
                registry: Arc::new(Registry::new()),
                shutdown: shutdown.clone(),
                errors: errors_tx,
                sessions: sessions_tx,
            };
            tokio::spawn(acceptor.run());

            Harness {
                addr,
                shutdown,
                errors,
                _sessions: sessions,
            }
        }

        /// Cancels everything and returns every error reported until the channel closed.
        async fn stop(mut self) -> Vec<ServerError> {
            self.shutdown.cancel();

            let mut reported = Vec::new();
            while let Some(err) = time::timeout(Duration::from_secs(5), self.errors.recv())
                .await
                .expect("error channel was not closed")
            {
                reported.push(err);
            }
            reported
        }
    }

    async fn ping(stream: &mut TcpStream) {
        stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut response = [0; 7];
        stream.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"+PONG\r\n");
    }

    async fn wait_closed(stream: &mut TcpStream) {
        let mut buf = [0; 16];
        let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn over_capacity_connection_is_reported_as_rejected() {
        let mut harness = Harness::start(1).await;

        let mut admitted = TcpStream::connect(harness.addr).await.unwrap();
        ping(&mut admitted).await;

        let mut rejected = TcpStream::connect(harness.addr).await.unwrap();
        wait_closed(&mut rejected).await;

        let err = time::timeout(Duration::from_secs(5), harness.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(err, ServerError::AdmissionRejected { max: 1, addr } if addr == rejected.local_addr().unwrap()),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(level(&err), Level::WARN);

        ping(&mut admitted).await;
        let reported = harness.stop().await;
        assert!(reported.is_empty(), "unexpected errors: {:?}", reported);
    }

    #[tokio::test]
    async fn shutdown_of_idle_sessions_reports_nothing() {
        let harness = Harness::start(10).await;

        let mut first = TcpStream::connect(harness.addr).await.unwrap();
        let mut second = TcpStream::connect(harness.addr).await.unwrap();
        ping(&mut first).await;
        ping(&mut second).await;

        let reported = harness.stop().await;

        assert!(reported.is_empty(), "unexpected errors: {:?}", reported);
        wait_closed(&mut first).await;
        wait_closed(&mut second).await;
    }

    #[tokio::test]
    async fn protocol_error_is_reported_for_its_session() {
        let harness = Harness::start(10).await;

        let mut client = TcpStream::connect(harness.addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        client.write_all(b"?oops\r\n").await.unwrap();
        wait_closed(&mut client).await;

        let reported = harness.stop().await;

        assert_eq!(reported.len(), 1, "unexpected errors: {:?}", reported);
        let err = &reported[0];
        assert!(
            matches!(
                err,
                ServerError::Session {
                    addr,
                    source: SessionError::Protocol(ProtocolError::InvalidDataType(b'?')),
                } if *addr == client_addr
            ),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(level(err), Level::WARN);
    }

    #[test]
    fn level_separates_client_faults_from_server_faults() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 1000));
        let session = |source| ServerError::Session { addr, source };

        assert_eq!(
            level(&ServerError::AdmissionRejected { addr, max: 1 }),
            Level::WARN
        );
        assert_eq!(
            level(&session(SessionError::Protocol(ProtocolError::TooDeep))),
            Level::WARN
        );
        assert_eq!(
            level(&ServerError::Accept(io::Error::from(io::ErrorKind::Other))),
            Level::ERROR
        );
        assert_eq!(
            level(&session(SessionError::WriteTimeout(Duration::from_secs(1)))),
            Level::ERROR
        );
        assert_eq!(
            level(&session(SessionError::Dispatch("boom".into()))),
            Level::ERROR
        );
    }
}
