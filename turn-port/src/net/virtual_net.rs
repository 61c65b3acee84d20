// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An in-process network.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;

use tracing::{debug, trace};

use super::{
    PacketSocket, PendingResolve, ResolveError, Resolver, SocketError, SocketFactory,
    SocketOption, SocketState,
};

const EPHEMERAL_PORT_START: u16 = 49152;

/// A network that lives entirely in memory.
///
/// Datagrams are queued at their destination as soon as they are sent, datagrams to an address
/// nobody is bound to are dropped.  Stream connects and host name lookups complete on the next
/// call to [`process`](Self::process).  Clones share the same network.
///
/// # Examples
///
/// ```
/// # use turn_port::net::{PacketSocket, SocketFactory, VirtualNetwork};
/// let network = VirtualNetwork::default();
/// let a = network.create_udp_socket("10.0.0.1".parse().unwrap()).unwrap();
/// let b = network.create_udp_socket("10.0.0.2".parse().unwrap()).unwrap();
/// a.send_to(&[1, 2, 3], b.local_addr()).unwrap();
/// let transmit = b.recv().unwrap();
/// assert_eq!(transmit.from, a.local_addr());
/// assert_eq!(transmit.data, vec![1, 2, 3]);
/// assert_eq!(network.open_sockets(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_id: usize,
    next_port: HashMap<IpAddr, u16>,
    sockets: BTreeMap<usize, SocketEntry>,
    listeners: BTreeMap<usize, ListenerEntry>,
    hosts: HashMap<String, Vec<IpAddr>>,
    resolutions: BTreeMap<usize, Resolution>,
}

#[derive(Debug)]
struct SocketEntry {
    transport: TransportType,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    state: SocketState,
    // the other end of a stream
    peer: Option<usize>,
    inbox: VecDeque<Transmit<Vec<u8>>>,
    options: Vec<SocketOption>,
}

#[derive(Debug)]
struct ListenerEntry {
    local_addr: SocketAddr,
    accepted: VecDeque<usize>,
}

#[derive(Debug)]
struct Resolution {
    host: String,
    result: Option<Result<Vec<IpAddr>, ResolveError>>,
}

impl NetworkInner {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn is_bound(&self, transport: TransportType, addr: SocketAddr) -> bool {
        self.sockets
            .values()
            .any(|socket| socket.transport == transport && socket.local_addr == addr)
            || (transport == TransportType::Tcp
                && self.listeners.values().any(|l| l.local_addr == addr))
    }

    fn ephemeral_addr(&mut self, transport: TransportType, ip: IpAddr) -> SocketAddr {
        loop {
            let port = self.next_port.entry(ip).or_insert(EPHEMERAL_PORT_START);
            let addr = SocketAddr::new(ip, *port);
            *port = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !self.is_bound(transport, addr) {
                return addr;
            }
        }
    }

    fn add_socket(&mut self, entry: SocketEntry) -> usize {
        let id = self.next_id();
        self.sockets.insert(id, entry);
        id
    }

    fn close_socket(&mut self, id: usize) {
        let Some(entry) = self.sockets.remove(&id) else {
            return;
        };
        trace!(
            "closing {} socket {} -> {:?}",
            entry.transport,
            entry.local_addr,
            entry.remote_addr
        );
        if let Some(peer) = entry.peer.and_then(|peer| self.sockets.get_mut(&peer)) {
            peer.state = SocketState::Closed;
            peer.peer = None;
        }
    }
}

impl VirtualNetwork {
    /// Make `host` resolve to `addresses`.
    pub fn add_host(&self, host: &str, addresses: Vec<IpAddr>) {
        self.inner
            .borrow_mut()
            .hosts
            .insert(host.to_owned(), addresses);
    }

    /// Bind a UDP socket to a specific address.
    pub fn bind_udp(&self, addr: SocketAddr) -> Result<VirtualSocket, SocketError> {
        let mut inner = self.inner.borrow_mut();
        if inner.is_bound(TransportType::Udp, addr) {
            return Err(SocketError::AddressInUse(addr));
        }
        let id = inner.add_socket(SocketEntry {
            transport: TransportType::Udp,
            local_addr: addr,
            remote_addr: None,
            state: SocketState::Connected,
            peer: None,
            inbox: VecDeque::new(),
            options: vec![],
        });
        Ok(VirtualSocket {
            id,
            inner: self.inner.clone(),
        })
    }

    /// Accept TCP connections to `addr`.
    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<VirtualListener, SocketError> {
        let mut inner = self.inner.borrow_mut();
        if inner.is_bound(TransportType::Tcp, addr) {
            return Err(SocketError::AddressInUse(addr));
        }
        let id = inner.next_id();
        inner.listeners.insert(
            id,
            ListenerEntry {
                local_addr: addr,
                accepted: VecDeque::new(),
            },
        );
        Ok(VirtualListener {
            id,
            local_addr: addr,
            inner: self.inner.clone(),
        })
    }

    /// Complete outstanding stream connects and host name lookups.
    pub fn process(&self) {
        let mut inner = self.inner.borrow_mut();

        let connecting = inner
            .sockets
            .iter()
            .filter(|(_id, socket)| socket.state == SocketState::Connecting)
            .map(|(id, socket)| (*id, socket.local_addr, socket.remote_addr))
            .collect::<Vec<_>>();
        for (id, local_addr, remote_addr) in connecting {
            let listener = remote_addr.and_then(|remote_addr| {
                inner
                    .listeners
                    .iter()
                    .find(|(_id, listener)| listener.local_addr == remote_addr)
                    .map(|(id, _listener)| *id)
            });
            let (Some(listener), Some(remote_addr)) = (listener, remote_addr) else {
                debug!("connection from {local_addr} to {remote_addr:?} refused");
                if let Some(socket) = inner.sockets.get_mut(&id) {
                    socket.state = SocketState::Closed;
                }
                continue;
            };
            let accepted = inner.add_socket(SocketEntry {
                transport: TransportType::Tcp,
                local_addr: remote_addr,
                remote_addr: Some(local_addr),
                state: SocketState::Connected,
                peer: Some(id),
                inbox: VecDeque::new(),
                options: vec![],
            });
            if let Some(socket) = inner.sockets.get_mut(&id) {
                socket.state = SocketState::Connected;
                socket.peer = Some(accepted);
            }
            if let Some(listener) = inner.listeners.get_mut(&listener) {
                listener.accepted.push_back(accepted);
            }
            debug!("connected {local_addr} to {remote_addr}");
        }

        let NetworkInner {
            hosts, resolutions, ..
        } = &mut *inner;
        for resolution in resolutions.values_mut() {
            if resolution.result.is_none() {
                resolution.result = Some(
                    hosts
                        .get(&resolution.host)
                        .cloned()
                        .ok_or_else(|| ResolveError::NotFound(resolution.host.clone())),
                );
            }
        }
    }

    /// The number of sockets that are currently open, including accepted streams.
    pub fn open_sockets(&self) -> usize {
        self.inner.borrow().sockets.len()
    }

    /// The number of host name lookups whose handle is still alive.
    pub fn pending_resolutions(&self) -> usize {
        self.inner.borrow().resolutions.len()
    }
}

impl SocketFactory for VirtualNetwork {
    fn create_udp_socket(&self, ip: IpAddr) -> Result<Box<dyn PacketSocket>, SocketError> {
        let addr = self
            .inner
            .borrow_mut()
            .ephemeral_addr(TransportType::Udp, ip);
        Ok(Box::new(self.bind_udp(addr)?))
    }

    fn create_client_tcp_socket(
        &self,
        local_ip: IpAddr,
        remote: SocketAddr,
    ) -> Result<Box<dyn PacketSocket>, SocketError> {
        if local_ip.is_ipv4() != remote.is_ipv4() {
            return Err(SocketError::AddressFamilyMismatch);
        }
        let mut inner = self.inner.borrow_mut();
        let local_addr = inner.ephemeral_addr(TransportType::Tcp, local_ip);
        let id = inner.add_socket(SocketEntry {
            transport: TransportType::Tcp,
            local_addr,
            remote_addr: Some(remote),
            state: SocketState::Connecting,
            peer: None,
            inbox: VecDeque::new(),
            options: vec![],
        });
        Ok(Box::new(VirtualSocket {
            id,
            inner: self.inner.clone(),
        }))
    }
}

impl Resolver for VirtualNetwork {
    fn resolve(&self, host: &str) -> Box<dyn PendingResolve> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.resolutions.insert(
            id,
            Resolution {
                host: host.to_owned(),
                result: None,
            },
        );
        Box::new(VirtualResolve {
            id,
            inner: self.inner.clone(),
        })
    }
}

/// A socket of a [`VirtualNetwork`].  Closed when dropped.
#[derive(Debug)]
pub struct VirtualSocket {
    id: usize,
    inner: Rc<RefCell<NetworkInner>>,
}

impl VirtualSocket {
    /// The options that were applied to this socket.
    pub fn options(&self) -> Vec<SocketOption> {
        self.inner
            .borrow()
            .sockets
            .get(&self.id)
            .map(|socket| socket.options.clone())
            .unwrap_or_default()
    }
}

impl PacketSocket for VirtualSocket {
    fn transport(&self) -> TransportType {
        self.inner
            .borrow()
            .sockets
            .get(&self.id)
            .map_or(TransportType::Udp, |socket| socket.transport)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner
            .borrow()
            .sockets
            .get(&self.id)
            .map_or(SocketAddr::new([0, 0, 0, 0].into(), 0), |socket| {
                socket.local_addr
            })
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner
            .borrow()
            .sockets
            .get(&self.id)
            .and_then(|socket| socket.remote_addr)
    }

    fn state(&self) -> SocketState {
        self.inner
            .borrow()
            .sockets
            .get(&self.id)
            .map_or(SocketState::Closed, |socket| socket.state)
    }

    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        let mut inner = self.inner.borrow_mut();
        let Some(socket) = inner.sockets.get(&self.id) else {
            return Err(SocketError::Closed);
        };
        let from = socket.local_addr;
        let transport = socket.transport;
        let destination = match transport {
            TransportType::Udp => inner
                .sockets
                .iter()
                .find(|(_id, socket)| {
                    socket.transport == TransportType::Udp && socket.local_addr == to
                })
                .map(|(id, _socket)| *id),
            TransportType::Tcp => {
                match socket.state {
                    SocketState::Connecting => return Err(SocketError::NotConnected),
                    SocketState::Closed => return Err(SocketError::Closed),
                    SocketState::Connected => (),
                }
                if socket.remote_addr != Some(to) {
                    return Err(SocketError::NotConnected);
                }
                Some(socket.peer.ok_or(SocketError::Closed)?)
            }
        };
        match destination.and_then(|id| inner.sockets.get_mut(&id)) {
            Some(destination) => {
                trace!("{transport} {from} -> {to}, {} bytes", data.len());
                destination
                    .inbox
                    .push_back(Transmit::new(data.to_vec(), transport, from, to));
            }
            None => trace!("dropping {} bytes from {from} to unbound {to}", data.len()),
        }
        Ok(())
    }

    fn recv(&self) -> Option<Transmit<Vec<u8>>> {
        self.inner
            .borrow_mut()
            .sockets
            .get_mut(&self.id)?
            .inbox
            .pop_front()
    }

    fn set_option(&self, option: SocketOption) -> Result<(), SocketError> {
        let mut inner = self.inner.borrow_mut();
        let socket = inner.sockets.get_mut(&self.id).ok_or(SocketError::Closed)?;
        super::cache_option(&mut socket.options, option);
        Ok(())
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        self.inner.borrow_mut().close_socket(self.id);
    }
}

/// A listening TCP socket of a [`VirtualNetwork`].
#[derive(Debug)]
pub struct VirtualListener {
    id: usize,
    local_addr: SocketAddr,
    inner: Rc<RefCell<NetworkInner>>,
}

impl VirtualListener {
    /// The address connections are accepted on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The next established connection.
    pub fn accept(&self) -> Option<VirtualSocket> {
        let id = self
            .inner
            .borrow_mut()
            .listeners
            .get_mut(&self.id)?
            .accepted
            .pop_front()?;
        Some(VirtualSocket {
            id,
            inner: self.inner.clone(),
        })
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(listener) = inner.listeners.remove(&self.id) {
            for id in listener.accepted {
                inner.close_socket(id);
            }
        }
    }
}

#[derive(Debug)]
struct VirtualResolve {
    id: usize,
    inner: Rc<RefCell<NetworkInner>>,
}

impl PendingResolve for VirtualResolve {
    fn poll(&mut self) -> Option<Result<Vec<IpAddr>, ResolveError>> {
        let mut inner = self.inner.borrow_mut();
        let resolution = inner.resolutions.get_mut(&self.id)?;
        let result = resolution.result.take()?;
        inner.resolutions.remove(&self.id);
        Some(result)
    }
}

impl Drop for VirtualResolve {
    fn drop(&mut self) {
        if self.inner.borrow_mut().resolutions.remove(&self.id).is_some() {
            trace!("cancelled lookup {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_unbound_destination() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let a = network
            .create_udp_socket("10.0.0.1".parse().unwrap())
            .unwrap();
        a.send_to(&[1], "10.0.0.2:1000".parse().unwrap()).unwrap();
        assert!(a.recv().is_none());
        assert!(matches!(
            network.bind_udp(a.local_addr()),
            Err(SocketError::AddressInUse(_))
        ));
    }

    #[test]
    fn tcp_connect_and_close() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let server_addr: SocketAddr = "10.0.0.2:3478".parse().unwrap();
        let listener = network.listen_tcp(server_addr).unwrap();
        let client = network
            .create_client_tcp_socket("10.0.0.1".parse().unwrap(), server_addr)
            .unwrap();
        assert_eq!(client.state(), SocketState::Connecting);
        assert!(matches!(
            client.send_to(&[1], server_addr),
            Err(SocketError::NotConnected)
        ));
        network.process();
        assert_eq!(client.state(), SocketState::Connected);
        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.remote_addr(), Some(client.local_addr()));

        client.send_to(&[1, 2], server_addr).unwrap();
        client.send_to(&[3], server_addr).unwrap();
        assert_eq!(accepted.recv().unwrap().data, vec![1, 2]);
        assert_eq!(accepted.recv().unwrap().data, vec![3]);

        assert_eq!(network.open_sockets(), 2);
        drop(accepted);
        assert_eq!(client.state(), SocketState::Closed);
        assert_eq!(network.open_sockets(), 1);
    }

    #[test]
    fn tcp_connection_refused() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let client = network
            .create_client_tcp_socket(
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2:3478".parse().unwrap(),
            )
            .unwrap();
        network.process();
        assert_eq!(client.state(), SocketState::Closed);
    }

    #[test]
    fn resolve() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        network.add_host("turn.example.org", vec!["10.0.0.2".parse().unwrap()]);
        let mut found = network.resolve("turn.example.org");
        let mut missing = network.resolve("unknown.example.org");
        assert!(found.poll().is_none());
        assert_eq!(network.pending_resolutions(), 2);
        network.process();
        assert_eq!(
            found.poll(),
            Some(Ok(vec!["10.0.0.2".parse().unwrap()]))
        );
        assert!(matches!(missing.poll(), Some(Err(ResolveError::NotFound(_)))));
        assert_eq!(network.pending_resolutions(), 0);
    }

    #[test]
    fn resolve_cancelled_on_drop() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let pending = network.resolve("turn.example.org");
        assert_eq!(network.pending_resolutions(), 1);
        drop(pending);
        assert_eq!(network.pending_resolutions(), 0);
        network.process();
    }
}
