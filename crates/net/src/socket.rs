//! TCP full-mesh bring-up and socket primitives.
//!
//! The root opens an outbound connection to every worker and tells each
//! one its node index plus the address of every other peer. Workers
//! then wire up among themselves with a deterministic rule: the
//! lower-index node listens, the higher-index node connects and
//! identifies itself with a hello word, so every node ends up with its
//! peers at known socket slots regardless of arrival order.
//!
//! All reads and writes chunk at 64 KiB. In turbo mode the sockets are
//! non-blocking and reads spin with a bounded retry; workers drop back
//! to blocking mode when idle.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use socket2::{Domain, Socket, Type};

use crate::error::{NetError, Result};

/// On a worker, socket 0 is always the root.
pub const ROOT_SOCKET_INDEX: usize = 0;

/// Mesh acknowledgement word.
pub const ACK: u32 = 23_571_114;

/// Upper bound for a single send/recv call.
pub const MAX_CHUNK: usize = 64 * 1024;

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    set_quickack(stream);
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_quickack(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let value: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_quickack(_stream: &TcpStream) {}

fn connect_peer(host: &str, port: u16) -> Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetError::Resolve(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| NetError::Resolve(format!("{host}:{port}")))?;
    let stream = TcpStream::connect(addr)?;
    tune_socket(&stream)?;
    Ok(stream)
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&format!("0.0.0.0:{port}").parse::<std::net::SocketAddr>().unwrap().into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

fn accept_peer(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, _) = listener.accept()?;
    tune_socket(&stream)?;
    Ok(stream)
}

/// One entry of a scatter/gather transfer.
pub struct WriteIo<'a> {
    pub socket_index: usize,
    pub data: &'a [u8],
}

pub struct ReadIo<'a> {
    pub socket_index: usize,
    pub data: &'a mut [u8],
}

/// The node's view of the mesh. On the root, `sockets[i]` is worker
/// `i + 1`; on a worker, socket 0 is the root and the remaining slots
/// hold the other workers in ascending node order.
pub struct Network {
    sockets: Vec<TcpStream>,
    node_index: u32,
    n_nodes: u32,
    sent_bytes: Vec<AtomicUsize>,
    recv_bytes: Vec<AtomicUsize>,
}

impl Network {
    fn from_sockets(sockets: Vec<TcpStream>, node_index: u32, n_nodes: u32) -> Self {
        let n = sockets.len();
        Network {
            sockets,
            node_index,
            n_nodes,
            sent_bytes: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            recv_bytes: (0..n).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Root-side bring-up: connect to every worker, announce its index
    /// and the other peers, then release them with an ACK once the
    /// whole roster answered.
    pub fn connect(workers: &[(String, u16)]) -> Result<Self> {
        assert!(!workers.is_empty());
        let n_workers = workers.len() as u32;
        let mut sockets = Vec::with_capacity(workers.len());

        for (i, (host, port)) in workers.iter().enumerate() {
            tracing::info!(socket = i, %host, port, "connecting to worker");
            let stream = connect_peer(host, *port)?;
            write_frame(&stream, &n_workers.to_le_bytes())?;
            write_frame(&stream, &(i as u32).to_le_bytes())?;
            for (j, (peer_host, peer_port)) in workers.iter().enumerate() {
                if j == i {
                    continue;
                }
                let host_bytes = peer_host.as_bytes();
                write_frame(&stream, &(host_bytes.len() as u32).to_le_bytes())?;
                write_frame(&stream, host_bytes)?;
                write_frame(&stream, &(*peer_port as u32).to_le_bytes())?;
            }
            read_ack_from(&stream)?;
            sockets.push(stream);
        }
        for stream in &sockets {
            write_frame(stream, &ACK.to_le_bytes())?;
        }
        tracing::info!(n_workers, "network is initialized");
        Ok(Network::from_sockets(sockets, 0, n_workers + 1))
    }

    /// Worker-side bring-up: accept the root, learn the roster, then
    /// connect out to lower-index peers while higher-index peers
    /// connect in.
    pub fn serve(port: u16) -> Result<Self> {
        let listener = bind_listener(port)?;
        tracing::info!(port, "listening for the root node");

        let root = accept_peer(&listener)?;
        let n_workers = read_u32_from(&root)?;
        let my_worker_index = read_u32_from(&root)?;
        let n_peers = n_workers - 1;
        tracing::info!(n_workers, my_worker_index, "root node connected");

        let mut peers = Vec::with_capacity(n_peers as usize);
        for _ in 0..n_peers {
            let host_len = read_u32_from(&root)? as usize;
            let mut host = vec![0u8; host_len];
            read_exact_from(&root, &mut host)?;
            let host = String::from_utf8(host)
                .map_err(|_| NetError::ConfigDecode("peer host is not utf-8".into()))?;
            let peer_port = read_u32_from(&root)? as u16;
            peers.push((host, peer_port));
        }

        write_frame(&root, &ACK.to_le_bytes())?;
        read_ack_from(&root)?; // root is ready

        let my_node = my_worker_index + 1;
        let mut sockets: Vec<Option<TcpStream>> = Vec::with_capacity(n_workers as usize);
        sockets.push(Some(root));
        for _ in 0..n_peers {
            sockets.push(None);
        }

        // Peer list position -> global node of that peer.
        let peer_node = |i: u32| if i < my_worker_index { i + 1 } else { i + 2 };
        // Global node -> my socket slot.
        let slot_for_node = |node: u32| -> usize {
            if node < my_node {
                node as usize
            } else {
                node as usize - 1
            }
        };

        // Deterministic pairing: the lower-index node listens, the
        // higher-index node connects and says who it is.
        let mut pending_accepts = 0u32;
        for i in 0..n_peers {
            let node = peer_node(i);
            if node < my_node {
                let (host, peer_port) = &peers[i as usize];
                tracing::debug!(node, %host, peer_port, "connecting to peer");
                let stream = connect_peer(host, *peer_port)?;
                write_frame(&stream, &my_node.to_le_bytes())?;
                sockets[slot_for_node(node)] = Some(stream);
            } else {
                pending_accepts += 1;
            }
        }
        for _ in 0..pending_accepts {
            let stream = accept_peer(&listener)?;
            let node = read_u32_from(&stream)?;
            tracing::debug!(node, "accepted peer");
            let slot = slot_for_node(node);
            if slot >= sockets.len() || sockets[slot].is_some() {
                return Err(NetError::ConfigDecode(format!(
                    "unexpected peer hello from node {node}"
                )));
            }
            sockets[slot] = Some(stream);
        }

        let sockets: Vec<TcpStream> = sockets
            .into_iter()
            .map(|s| s.ok_or_else(|| NetError::ConfigDecode("mesh is incomplete".into())))
            .collect::<Result<_>>()?;
        tracing::info!(node = my_node, "network is initialized");
        Ok(Network::from_sockets(sockets, my_node, n_workers + 1))
    }

    pub fn n_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    pub fn n_nodes(&self) -> u32 {
        self.n_nodes
    }

    pub fn is_root(&self) -> bool {
        self.node_index == 0
    }

    /// Socket slot holding the connection to `target`.
    pub fn socket_index_for_node(&self, target: u32) -> usize {
        assert_ne!(target, self.node_index, "no socket to self");
        if self.node_index == 0 {
            (target - 1) as usize
        } else if target < self.node_index {
            target as usize
        } else {
            (target - 1) as usize
        }
    }

    /// Toggles non-blocking mode on every socket.
    pub fn set_turbo(&self, enabled: bool) -> Result<()> {
        for socket in &self.sockets {
            socket.set_nonblocking(enabled)?;
        }
        Ok(())
    }

    pub fn write(&self, socket_index: usize, data: &[u8]) -> Result<()> {
        let stream = &self.sockets[socket_index];
        for chunk in data.chunks(MAX_CHUNK) {
            write_frame(stream, chunk)?;
        }
        self.sent_bytes[socket_index].fetch_add(data.len(), Ordering::Relaxed);
        Ok(())
    }

    pub fn read(&self, socket_index: usize, data: &mut [u8]) -> Result<()> {
        let stream = &self.sockets[socket_index];
        for chunk in data.chunks_mut(MAX_CHUNK) {
            read_exact_from(stream, chunk)?;
        }
        self.recv_bytes[socket_index].fetch_add(data.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Attempts a read, giving up after `max_attempts` empty polls when
    /// nothing has arrived yet. Once the first byte lands the read runs
    /// to completion.
    pub fn try_read_with_max_attempts(
        &self,
        socket_index: usize,
        data: &mut [u8],
        max_attempts: u32,
    ) -> Result<bool> {
        let stream = &self.sockets[socket_index];
        let mut filled = 0usize;
        let mut attempts_left = max_attempts;
        while filled < data.len() {
            match (&*stream).read(&mut data[filled..]) {
                Ok(0) => {
                    return Err(NetError::Transfer(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "socket closed",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if filled == 0 && max_attempts > 0 {
                        attempts_left -= 1;
                        if attempts_left == 0 {
                            return Ok(false);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(NetError::Transfer(e)),
            }
        }
        self.recv_bytes[socket_index].fetch_add(data.len(), Ordering::Relaxed);
        Ok(true)
    }

    /// Writes every io entry, multiplexing across sockets so one slow
    /// peer does not serialize the rest.
    pub fn write_many(&self, ios: &mut [WriteIo<'_>]) -> Result<()> {
        for io in ios.iter() {
            self.sent_bytes[io.socket_index].fetch_add(io.data.len(), Ordering::Relaxed);
        }
        loop {
            let mut writing = false;
            for io in ios.iter_mut() {
                if io.data.is_empty() {
                    continue;
                }
                writing = true;
                let stream = &self.sockets[io.socket_index];
                let chunk = io.data.len().min(MAX_CHUNK);
                match (&*stream).write(&io.data[..chunk]) {
                    Ok(0) => {
                        return Err(NetError::Transfer(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "socket closed",
                        )))
                    }
                    Ok(n) => io.data = &io.data[n..],
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(NetError::Transfer(e)),
                }
            }
            if !writing {
                return Ok(());
            }
        }
    }

    pub fn read_many(&self, ios: &mut [ReadIo<'_>]) -> Result<()> {
        for io in ios.iter() {
            self.recv_bytes[io.socket_index].fetch_add(io.data.len(), Ordering::Relaxed);
        }
        loop {
            let mut reading = false;
            for io in ios.iter_mut() {
                if io.data.is_empty() {
                    continue;
                }
                reading = true;
                let stream = &self.sockets[io.socket_index];
                match (&*stream).read(io.data) {
                    Ok(0) => {
                        return Err(NetError::Transfer(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "socket closed",
                        )))
                    }
                    Ok(n) => {
                        let data = std::mem::take(&mut io.data);
                        io.data = &mut data[n..];
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(NetError::Transfer(e)),
                }
            }
            if !reading {
                return Ok(());
            }
        }
    }

    /// Broadcasts `data` on every socket.
    pub fn write_to_all(&self, data: &[u8]) -> Result<()> {
        let mut ios: Vec<WriteIo<'_>> = (0..self.sockets.len())
            .map(|socket_index| WriteIo { socket_index, data })
            .collect();
        self.write_many(&mut ios)
    }

    pub fn write_ack(&self, socket_index: usize) -> Result<()> {
        self.write(socket_index, &ACK.to_le_bytes())
    }

    pub fn read_ack(&self, socket_index: usize) -> Result<()> {
        let mut buf = [0u8; 4];
        self.read(socket_index, &mut buf)?;
        let word = LittleEndian::read_u32(&buf);
        if word != ACK {
            return Err(NetError::InvalidAck(word));
        }
        Ok(())
    }

    /// Returns and resets the transfer counters.
    pub fn take_stats(&self) -> (usize, usize) {
        let mut sent = 0;
        let mut recv = 0;
        for counter in &self.sent_bytes {
            sent += counter.swap(0, Ordering::Relaxed);
        }
        for counter in &self.recv_bytes {
            recv += counter.swap(0, Ordering::Relaxed);
        }
        (sent, recv)
    }
}

/// Writes the whole buffer, retrying on EAGAIN so turbo-mode sockets
/// behave like blocking ones for small control frames.
fn write_frame(stream: &TcpStream, data: &[u8]) -> Result<()> {
    let mut remaining = data;
    while !remaining.is_empty() {
        match (&*stream).write(remaining) {
            Ok(0) => {
                return Err(NetError::Transfer(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket closed",
                )))
            }
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(NetError::Transfer(e)),
        }
    }
    Ok(())
}

fn read_exact_from(stream: &TcpStream, data: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < data.len() {
        match (&*stream).read(&mut data[filled..]) {
            Ok(0) => {
                return Err(NetError::Transfer(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "socket closed",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(NetError::Transfer(e)),
        }
    }
    Ok(())
}

fn read_u32_from(stream: &TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_from(stream, &mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

fn read_ack_from(stream: &TcpStream) -> Result<()> {
    let word = read_u32_from(stream)?;
    if word != ACK {
        return Err(NetError::InvalidAck(word));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_index_mapping_root() {
        let mapping = |node_index: u32, target: u32| -> usize {
            // Mirror of socket_index_for_node without a live Network.
            if node_index == 0 {
                (target - 1) as usize
            } else if target < node_index {
                target as usize
            } else {
                (target - 1) as usize
            }
        };
        // Root: worker n lives at slot n-1.
        assert_eq!(mapping(0, 1), 0);
        assert_eq!(mapping(0, 3), 2);
        // Worker 2 of a 4-node mesh: [root, node1, node3].
        assert_eq!(mapping(2, 0), 0);
        assert_eq!(mapping(2, 1), 1);
        assert_eq!(mapping(2, 3), 2);
    }
}
