// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sockets and name resolution from the standard library.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::mpsc;
use std::time::Duration;

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;

use tracing::{debug, trace, warn};

use super::{
    PacketSocket, PendingResolve, ResolveError, Resolver, SocketError, SocketFactory,
    SocketOption, SocketState,
};

const MAX_DATAGRAM: usize = 65536;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PENDING_WRITE: usize = 4 * 1024 * 1024;

/// [`SocketFactory`] and [`Resolver`] over `std::net`.
///
/// Stream connects and host name lookups run on a helper thread each.  Dropping the socket or
/// the lookup handle before completion detaches the thread and discards its result.  A detached
/// connect keeps its file descriptor until the connect completes or times out after 30 seconds.
///
/// Stream writes never block: what the kernel does not accept is kept and written on later
/// calls to `send_to`, `recv` or `state`.  More than 4 MiB of unwritten data fails the send with
/// [`SocketError::BufferFull`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdNetwork {}

impl StdNetwork {
    /// Construct a new [`StdNetwork`].
    pub fn new() -> Self {
        Self {}
    }
}

impl SocketFactory for StdNetwork {
    fn create_udp_socket(&self, ip: IpAddr) -> Result<Box<dyn PacketSocket>, SocketError> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        debug!("bound UDP socket to {local_addr}");
        Ok(Box::new(StdUdpSocket { socket, local_addr }))
    }

    fn create_client_tcp_socket(
        &self,
        local_ip: IpAddr,
        remote: SocketAddr,
    ) -> Result<Box<dyn PacketSocket>, SocketError> {
        if local_ip.is_ipv4() != remote.is_ipv4() {
            return Err(SocketError::AddressFamilyMismatch);
        }
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let result = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT).and_then(|stream| {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(stream)
            });
            // the receiver is gone if the socket was dropped while connecting
            let _ = sender.send(result);
        });
        Ok(Box::new(StdTcpSocket {
            remote_addr: remote,
            local_ip,
            state: RefCell::new(TcpState::Connecting(receiver)),
        }))
    }
}

impl Resolver for StdNetwork {
    fn resolve(&self, host: &str) -> Box<dyn PendingResolve> {
        let (sender, receiver) = mpsc::channel();
        let host = host.to_owned();
        std::thread::spawn(move || {
            let result = (host.as_str(), 0)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>())
                .map_err(|e| ResolveError::Io(e.kind()))
                .and_then(|addrs| {
                    if addrs.is_empty() {
                        Err(ResolveError::NotFound(host.clone()))
                    } else {
                        Ok(addrs)
                    }
                });
            let _ = sender.send(result);
        });
        Box::new(StdResolve { receiver })
    }
}

#[derive(Debug)]
struct StdResolve {
    receiver: mpsc::Receiver<Result<Vec<IpAddr>, ResolveError>>,
}

impl PendingResolve for StdResolve {
    fn poll(&mut self) -> Option<Result<Vec<IpAddr>, ResolveError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(ResolveError::Cancelled)),
        }
    }
}

#[derive(Debug)]
struct StdUdpSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl PacketSocket for StdUdpSocket {
    fn transport(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn state(&self) -> SocketState {
        SocketState::Connected
    }

    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        match self.socket.send_to(data, to) {
            Ok(_) => Ok(()),
            // datagrams may be dropped
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("dropping {} bytes to {to}, socket is full", data.len());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&self) -> Option<Transmit<Vec<u8>>> {
        let mut buf = vec![0; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                buf.truncate(len);
                Some(Transmit::new(buf, TransportType::Udp, from, self.local_addr))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                // e.g. ICMP port unreachable reported on a later receive
                debug!("receive error on {}: {e}", self.local_addr);
                None
            }
        }
    }

    fn set_option(&self, option: SocketOption) -> Result<(), SocketError> {
        match option {
            SocketOption::Ttl(ttl) => Ok(self.socket.set_ttl(ttl)?),
            _ => Err(SocketError::UnsupportedOption),
        }
    }
}

#[derive(Debug)]
enum TcpState {
    Connecting(mpsc::Receiver<std::io::Result<TcpStream>>),
    Connected {
        stream: TcpStream,
        local_addr: SocketAddr,
        pending: Vec<u8>,
    },
    Closed,
}

#[derive(Debug)]
struct StdTcpSocket {
    remote_addr: SocketAddr,
    local_ip: IpAddr,
    state: RefCell<TcpState>,
}

impl StdTcpSocket {
    fn update_state(&self) {
        let mut state = self.state.borrow_mut();
        let TcpState::Connecting(receiver) = &*state else {
            return;
        };
        let new_state = match receiver.try_recv() {
            Ok(Ok(stream)) => match stream.local_addr() {
                Ok(local_addr) => {
                    debug!("connected {local_addr} to {}", self.remote_addr);
                    TcpState::Connected {
                        stream,
                        local_addr,
                        pending: vec![],
                    }
                }
                Err(e) => {
                    warn!("connected socket has no local address: {e}");
                    TcpState::Closed
                }
            },
            Ok(Err(e)) => {
                debug!("failed to connect to {}: {e}", self.remote_addr);
                TcpState::Closed
            }
            Err(mpsc::TryRecvError::Empty) => return,
            Err(mpsc::TryRecvError::Disconnected) => TcpState::Closed,
        };
        *state = new_state;
    }

    // Write as much of the unwritten data as the stream accepts.
    fn flush(&self) {
        let mut state = self.state.borrow_mut();
        let TcpState::Connected {
            stream, pending, ..
        } = &mut *state
        else {
            return;
        };
        if let Err(e) = write_some(stream, pending) {
            debug!("failed to write to {}: {e}", self.remote_addr);
            *state = TcpState::Closed;
        }
    }
}

// Writes from the front of `pending` until the stream would block.
fn write_some(stream: &mut TcpStream, pending: &mut Vec<u8>) -> std::io::Result<()> {
    let mut written = 0;
    while written < pending.len() {
        match stream.write(&pending[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    if written > 0 {
        trace!("wrote {written} bytes, {} left", pending.len() - written);
        pending.drain(..written);
    }
    Ok(())
}

impl PacketSocket for StdTcpSocket {
    fn transport(&self) -> TransportType {
        TransportType::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.update_state();
        match &*self.state.borrow() {
            TcpState::Connected { local_addr, .. } => *local_addr,
            _ => SocketAddr::new(self.local_ip, 0),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn state(&self) -> SocketState {
        self.update_state();
        self.flush();
        match &*self.state.borrow() {
            TcpState::Connecting(_) => SocketState::Connecting,
            TcpState::Connected { .. } => SocketState::Connected,
            TcpState::Closed => SocketState::Closed,
        }
    }

    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        if to != self.remote_addr {
            return Err(SocketError::NotConnected);
        }
        self.update_state();
        let mut state = self.state.borrow_mut();
        let TcpState::Connected {
            stream, pending, ..
        } = &mut *state
        else {
            return Err(SocketError::NotConnected);
        };
        if !pending.is_empty() {
            if let Err(e) = write_some(stream, pending) {
                *state = TcpState::Closed;
                return Err(e.into());
            }
        }
        if pending.len() + data.len() > MAX_PENDING_WRITE {
            debug!(
                "{} bytes are still waiting for {}, refusing {} more",
                pending.len(),
                self.remote_addr,
                data.len()
            );
            return Err(SocketError::BufferFull);
        }
        pending.extend_from_slice(data);
        if let Err(e) = write_some(stream, pending) {
            *state = TcpState::Closed;
            return Err(e.into());
        }
        Ok(())
    }

    fn recv(&self) -> Option<Transmit<Vec<u8>>> {
        self.update_state();
        self.flush();
        let mut state = self.state.borrow_mut();
        let TcpState::Connected {
            stream, local_addr, ..
        } = &mut *state
        else {
            return None;
        };
        let local_addr = *local_addr;
        let mut buf = vec![0; MAX_DATAGRAM];
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("{} closed the connection", self.remote_addr);
                *state = TcpState::Closed;
                None
            }
            Ok(len) => {
                buf.truncate(len);
                Some(Transmit::new(
                    buf,
                    TransportType::Tcp,
                    self.remote_addr,
                    local_addr,
                ))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                debug!("receive error from {}: {e}", self.remote_addr);
                *state = TcpState::Closed;
                None
            }
        }
    }

    fn set_option(&self, option: SocketOption) -> Result<(), SocketError> {
        self.update_state();
        match (&*self.state.borrow(), option) {
            (TcpState::Connected { stream, .. }, SocketOption::Ttl(ttl)) => {
                Ok(stream.set_ttl(ttl)?)
            }
            (TcpState::Connected { .. }, _) => Err(SocketError::UnsupportedOption),
            _ => Err(SocketError::NotConnected),
        }
    }
}
