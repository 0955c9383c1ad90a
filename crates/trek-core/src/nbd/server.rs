//! Blocking NBD server, one thread per client.
//!
//! All connections share one [`BlockIo`]; the device session underneath
//! serializes their USB transactions. When the device stops being usable
//! every connection winds down and [`NbdServer::serve`] returns.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::constants::{MAX_REQUEST_BYTES, NBD_REQUEST_MAGIC};
use super::export::ExportDescriptor;
use super::handshake::{self, HandshakeOutcome, Negotiated};
use super::transmission::{
    Request, send_simple_reply, send_structured_data, send_structured_error, wire_error,
};
use crate::blockdev::BlockDevice;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, BridgeObserver, RequestKind, TracingObserver};
use crate::translator::BlockIo;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a client connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Client aborted during negotiation.
    Aborted,
    /// Client sent `NBD_CMD_DISC`.
    Disconnected,
    /// Client closed the socket.
    ClientGone,
    /// The device session stopped serving.
    SessionLost,
}

/// NBD server exporting a single block device.
pub struct NbdServer<D: BlockDevice, O: BridgeObserver = TracingObserver> {
    io: Arc<BlockIo<D>>,
    export: Arc<ExportDescriptor>,
    observer: Arc<O>,
    stop: Arc<AtomicBool>,
}

impl<D: BlockDevice, O: BridgeObserver> Clone for NbdServer<D, O> {
    fn clone(&self) -> Self {
        Self {
            io: Arc::clone(&self.io),
            export: Arc::clone(&self.export),
            observer: Arc::clone(&self.observer),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<D: BlockDevice + 'static> NbdServer<D, TracingObserver> {
    pub fn new(io: BlockIo<D>, export: ExportDescriptor) -> Self {
        Self::with_observer(io, export, Arc::new(TracingObserver))
    }
}

impl<D: BlockDevice + 'static, O: BridgeObserver + 'static> NbdServer<D, O> {
    pub fn with_observer(io: BlockIo<D>, export: ExportDescriptor, observer: Arc<O>) -> Self {
        Self {
            io: Arc::new(io),
            export: Arc::new(export),
            observer,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn io(&self) -> &BlockIo<D> {
        &self.io
    }

    /// Make [`serve`](Self::serve) return at its next poll.
    ///
    /// Connections already in progress run until their client leaves.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Accept clients until shut down or the device becomes unusable.
    ///
    /// Returns `Err(SessionClosed)` when the device session was torn down.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?.to_string();
        self.emit(BridgeEvent::Listening {
            address,
            export: self.export.name.clone(),
        });

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("NBD server shutting down");
                return Ok(());
            }
            if !self.io.device().is_usable() {
                self.emit(BridgeEvent::SessionTornDown {
                    reason: format!("{} is no longer usable", self.io.device().describe()),
                });
                return Err(BridgeError::SessionClosed);
            }

            match listener.accept() {
                Ok((stream, addr)) => {
                    let peer = addr.to_string();
                    stream.set_nonblocking(false)?;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let server = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("nbd-{}", peer))
                        .spawn(move || {
                            if let Err(e) = server.handle_connection(stream, &peer) {
                                warn!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    if let Err(e) = spawned {
                        warn!(error = %e, "Failed to spawn connection thread");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    /// Negotiate with and then serve one client until it leaves.
    #[instrument(level = "debug", skip(self, stream))]
    pub fn handle_connection<S: Read + Write>(&self, mut stream: S, peer: &str) -> Result<ConnectionEnd> {
        self.emit(BridgeEvent::ClientConnected {
            peer: peer.to_string(),
        });
        let result = self.run_connection(&mut stream, peer);
        self.emit(BridgeEvent::ClientDisconnected {
            peer: peer.to_string(),
        });
        result
    }

    fn run_connection<S: Read + Write>(&self, stream: &mut S, peer: &str) -> Result<ConnectionEnd> {
        let negotiated = match handshake::negotiate(stream, &self.export)? {
            HandshakeOutcome::Aborted => return Ok(ConnectionEnd::Aborted),
            HandshakeOutcome::Transmission(negotiated) => negotiated,
        };
        self.emit(BridgeEvent::HandshakeComplete {
            peer: peer.to_string(),
            size: self.export.size_bytes,
            structured_replies: negotiated.structured_replies,
        });
        self.transmit(stream, negotiated)
    }

    fn transmit<S: Read + Write>(&self, stream: &mut S, negotiated: Negotiated) -> Result<ConnectionEnd> {
        loop {
            let request = match Request::read_from(stream) {
                Ok(request) => request,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(ConnectionEnd::ClientGone),
                Err(e) => return Err(e.into()),
            };
            if request.magic != NBD_REQUEST_MAGIC {
                return Err(BridgeError::Protocol(format!(
                    "bad request magic 0x{:08x}",
                    request.magic
                )));
            }

            let kind = request.kind();
            let result = match kind {
                RequestKind::Disconnect => return Ok(ConnectionEnd::Disconnected),
                RequestKind::Read => self.serve_read(&request),
                RequestKind::Write => {
                    if request.length > MAX_REQUEST_BYTES {
                        return Err(BridgeError::Protocol(format!(
                            "write payload of {} bytes",
                            request.length
                        )));
                    }
                    let mut payload = vec![0u8; request.length as usize];
                    stream.read_exact(&mut payload)?;
                    self.serve_write(&request, &payload).map(|()| Vec::new())
                }
                RequestKind::Flush => Ok(Vec::new()),
                RequestKind::Other(command) => Err(BridgeError::Protocol(format!(
                    "unsupported command {}",
                    command
                ))),
            };

            match result {
                Ok(data) => {
                    self.emit(BridgeEvent::Request {
                        kind,
                        offset: request.offset,
                        length: request.length,
                    });
                    self.reply_ok(stream, &request, negotiated, &data)?;
                }
                Err(err) => {
                    let code = wire_error(&err);
                    self.emit(BridgeEvent::RequestFailed {
                        kind,
                        offset: request.offset,
                        length: request.length,
                        code,
                        message: err.to_string(),
                    });
                    self.reply_err(stream, &request, negotiated, code, &err)?;

                    if err.is_session_fatal() || !self.io.device().is_usable() {
                        return Ok(ConnectionEnd::SessionLost);
                    }
                }
            }
        }
    }

    fn serve_read(&self, request: &Request) -> Result<Vec<u8>> {
        if request.length > MAX_REQUEST_BYTES {
            return Err(BridgeError::Protocol(format!(
                "read of {} bytes exceeds {}",
                request.length, MAX_REQUEST_BYTES
            )));
        }
        self.io.read(request.offset, request.length as usize)
    }

    fn serve_write(&self, request: &Request, payload: &[u8]) -> Result<()> {
        if self.export.read_only {
            return Err(BridgeError::ReadOnly);
        }
        self.io.write(request.offset, payload)
    }

    fn reply_ok<W: Write>(
        &self,
        stream: &mut W,
        request: &Request,
        negotiated: Negotiated,
        data: &[u8],
    ) -> io::Result<()> {
        if negotiated.structured_replies && request.kind() == RequestKind::Read {
            send_structured_data(stream, request.cookie, request.offset, data)
        } else {
            send_simple_reply(stream, request.cookie, 0, data)
        }
    }

    fn reply_err<W: Write>(
        &self,
        stream: &mut W,
        request: &Request,
        negotiated: Negotiated,
        code: u32,
        err: &BridgeError,
    ) -> io::Result<()> {
        if negotiated.structured_replies && request.kind() == RequestKind::Read {
            send_structured_error(stream, request.cookie, code, &err.to_string())
        } else {
            send_simple_reply(stream, request.cookie, code, &[])
        }
    }

    fn emit(&self, event: BridgeEvent) {
        self.observer.on_event(&event);
    }
}
