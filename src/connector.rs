use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::UserConfig;
use crate::protocol::{self, ProtocolError, Request, Response, Result};

/// Where a connected exchange currently stands. A connector without a live
/// socket has no phase at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connected,
    RequestSent,
    Streaming,
    ResponseReceived,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Applied to connect, read and write on the socket. `None` blocks forever.
    pub timeout: Option<Duration>,
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    phase: Phase,
    peer: String,
}

/// Owns the single TCP connection used by one command invocation and drives
/// the request / signal / stream / response sequence over it.
pub struct ServerConnector {
    credentials: UserConfig,
    options: ConnectOptions,
    auth_enabled: bool,
    session: Option<Session>,
}

impl ServerConnector {
    pub fn new(credentials: UserConfig, options: ConnectOptions) -> Self {
        Self {
            credentials,
            options,
            auth_enabled: false,
            session: None,
        }
    }

    /// Opens the connection. Does nothing if one is already open.
    pub fn connect(&mut self, host: &str, port: &str) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let addr = format!("{host}:{port}");
        let stream = self
            .open(&addr)
            .map_err(|source| ProtocolError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;

        stream.set_read_timeout(self.options.timeout)?;
        stream.set_write_timeout(self.options.timeout)?;
        let reader = BufReader::new(stream.try_clone()?);

        info!("Connected to {}", addr);
        self.session = Some(Session {
            reader,
            writer: stream,
            phase: Phase::Connected,
            peer: addr,
        });
        Ok(())
    }

    fn open(&self, addr: &str) -> std::io::Result<TcpStream> {
        let addrs: Vec<_> = addr.to_socket_addrs()?.collect();
        match self.options.timeout {
            None => TcpStream::connect(addrs.as_slice()),
            Some(timeout) => {
                let mut last_err = None;
                for candidate in &addrs {
                    match TcpStream::connect_timeout(candidate, timeout) {
                        Ok(stream) => return Ok(stream),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(ErrorKind::InvalidInput, "address resolved to nothing")
                }))
            }
        }
    }

    /// Closes the connection. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            // The peer may already have gone away; there is nothing left to report.
            let _ = session.writer.shutdown(Shutdown::Both);
            debug!("Disconnected from {}", session.peer);
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    #[cfg(test)]
    pub fn phase(&self) -> Option<Phase> {
        self.session.as_ref().map(|s| s.phase)
    }

    /// Controls whether `user` and the hashed token are added to the meta of
    /// every request sent afterwards.
    pub fn set_auth_enabled(&mut self, enabled: bool) {
        self.auth_enabled = enabled;
    }

    pub fn send_request(&mut self, mut request: Request) -> Result<()> {
        let session = self.session.as_mut().ok_or(ProtocolError::NotConnected)?;
        if !matches!(session.phase, Phase::Connected | Phase::ResponseReceived) {
            return Err(ProtocolError::OutOfSequence {
                operation: "send a request",
                phase: session.phase,
            });
        }

        if self.auth_enabled {
            request
                .meta
                .insert("user".into(), self.credentials.user.clone().into());
            request.meta.insert(
                "token".into(),
                protocol::token_digest(&self.credentials.token).into(),
            );
        }

        let frame = protocol::encode(&request)?;
        session.writer.write_all(&frame).map_err(io_error)?;
        session.writer.flush().map_err(io_error)?;
        session.phase = Phase::RequestSent;

        debug!(action = %request.action, auth = self.auth_enabled, "Request sent");
        Ok(())
    }

    /// Blocks until the server sends one line and checks it equals `expected`.
    /// Only after this succeeds does [`Self::data_stream`] hand out the socket.
    pub fn wait_for_signal(&mut self, expected: &str) -> Result<()> {
        self.expect_phase("wait for a signal", &[Phase::RequestSent])?;
        // Only ever compared against `expected`; lossy text is enough for the error.
        let line = String::from_utf8_lossy(&self.read_line()?).into_owned();
        let actual = line.trim();
        if actual != expected {
            return Err(ProtocolError::UnexpectedSignal {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        debug!("Received signal '{}'", expected);
        self.set_phase(Phase::Streaming);
        Ok(())
    }

    /// Write side of the connection for raw streaming.
    pub fn data_stream(&mut self) -> Result<&mut TcpStream> {
        self.expect_phase("stream data", &[Phase::Streaming])?;
        let session = self.session.as_mut().ok_or(ProtocolError::NotConnected)?;
        Ok(&mut session.writer)
    }

    pub fn get_response(&mut self) -> Result<Response> {
        self.expect_phase("read a response", &[Phase::RequestSent, Phase::Streaming])?;
        let line = String::from_utf8(self.read_line()?)
            .map_err(|e| ProtocolError::InvalidUtf8 { raw: e.into_bytes() })?;
        let response = protocol::decode(&line)?;
        self.set_phase(Phase::ResponseReceived);

        debug!(code = response.code, "Response received");
        Ok(response)
    }

    /// Sends `request`, reads its response and disconnects, whichever way the
    /// exchange ends.
    pub fn send_and_disconnect(&mut self, request: Request) -> Result<Response> {
        let result = self
            .send_request(request)
            .and_then(|()| self.get_response());
        self.disconnect();
        result
    }

    fn expect_phase(&self, operation: &'static str, allowed: &[Phase]) -> Result<()> {
        let session = self.session.as_ref().ok_or(ProtocolError::NotConnected)?;
        if allowed.contains(&session.phase) {
            Ok(())
        } else {
            Err(ProtocolError::OutOfSequence {
                operation,
                phase: session.phase,
            })
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(session) = self.session.as_mut() {
            session.phase = phase;
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let session = self.session.as_mut().ok_or(ProtocolError::NotConnected)?;
        let mut buf = Vec::new();
        let n = session
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(io_error)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(buf)
    }
}

impl Drop for ServerConnector {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn io_error(e: std::io::Error) -> ProtocolError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ProtocolError::TimedOut,
        _ => ProtocolError::Io(e),
    }
}
