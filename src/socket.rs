//! The socket API.
//!
//! All blocking operations are async and take millisecond-scale timeouts
//! (`None` waits forever). `connect` and reliable `send` block on the
//! socket's ACK signal; `accept`, `recv` and `recv_from` block on the
//! socket's bounded queues. None of them hold the socket table lock while
//! waiting.

use std::time::Duration;

use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{ACK_TIMEOUT, MTU, RETRY_LIMIT};
use crate::error::{Result, StackError};
use crate::packet_header::{Flags, PacketHeader, Priority};
use crate::socket_table::{SocketId, SocketState, SocketType};
use crate::stack::{ControlFrame, Stack};

impl Stack {
    /// Allocate a socket slot of the given type.
    pub fn socket(&self, ty: SocketType) -> Result<SocketId> {
        let mut table = self.sockets.lock().unwrap();
        table
            .allocate(ty, self.local_node(), &self.pool)
            .ok_or(StackError::SocketsExhausted)
    }

    /// Bind to a local port; port 0 picks an ephemeral port.
    pub fn bind(&self, sock: SocketId, port: u16) -> Result<()> {
        self.sockets.lock().unwrap().bind(sock, port)
    }

    /// Start accepting connections. Valid on a bound stream socket that
    /// is not yet connected. The backlog is fixed by the accept queue
    /// depth; the argument is accepted for familiarity.
    pub fn listen(&self, sock: SocketId, _backlog: usize) -> Result<()> {
        let mut table = self.sockets.lock().unwrap();
        let slot = &mut table.slots[sock.0];
        if slot.ty != SocketType::Stream {
            return Err(StackError::WrongSocketType);
        }
        if slot.state != SocketState::Open {
            return Err(StackError::InvalidArgument);
        }
        slot.state = SocketState::Listening;
        Ok(())
    }

    /// Connect to a remote node and port.
    ///
    /// On a stream socket this runs the three-way handshake and blocks up
    /// to [`ACK_TIMEOUT`]; on a datagram socket it just records the
    /// default peer. An unbound socket is bound to an ephemeral port
    /// first.
    pub async fn connect(&self, sock: SocketId, node: u8, port: u8) -> Result<()> {
        let (signal, local_port) = {
            let mut table = self.sockets.lock().unwrap();
            if table.slots[sock.0].local_port == 0 {
                table.bind(sock, 0)?;
            }

            let slot = &mut table.slots[sock.0];
            slot.remote_node = node;
            slot.remote_port = port;

            if slot.ty == SocketType::Datagram {
                slot.state = SocketState::Established;
                return Ok(());
            }

            info!(
                "connecting to node {} port {} from local port {}",
                node, port, slot.local_port
            );
            slot.state = SocketState::SynSent;
            (slot.signal.clone(), slot.local_port)
        };

        self.emit_control(ControlFrame {
            dst_node: node,
            dst_port: port,
            src_port: local_port as u8,
            flags: Flags::SYN,
            ack_seq: None,
        });

        match time::timeout(ACK_TIMEOUT, signal.notified()).await {
            Ok(()) => {
                info!("connection established");
                Ok(())
            }
            Err(_) => {
                warn!("connect timed out");
                self.sockets.lock().unwrap().slots[sock.0].state = SocketState::Open;
                Err(StackError::Timeout)
            }
        }
    }

    /// Wait for an incoming connection on a listening socket and return
    /// the accepted child socket.
    pub async fn accept(&self, sock: SocketId, timeout: Option<Duration>) -> Result<SocketId> {
        let accept_rx = self.sockets.lock().unwrap().slots[sock.0].accept_rx.clone();
        let mut accept_rx = accept_rx.lock().await;

        let child = match timeout {
            Some(limit) => time::timeout(limit, accept_rx.recv())
                .await
                .map_err(|_| StackError::Timeout)?,
            None => accept_rx.recv().await,
        };
        child.ok_or(StackError::Timeout)
    }

    /// Send on a connected socket. Streams run stop-and-wait: the call
    /// returns once the peer acknowledged the segment, retrying up to
    /// [`RETRY_LIMIT`] times. Datagram sends go to the default peer and
    /// return immediately.
    pub async fn send(&self, sock: SocketId, data: &[u8]) -> Result<usize> {
        // one byte of every packet is reserved for the sequence number
        if data.len() > MTU - 1 {
            return Err(StackError::InvalidArgument);
        }

        let (ty, local_node, remote_node, remote_port, local_port, signal) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (
                slot.ty,
                slot.local_node,
                slot.remote_node,
                slot.remote_port,
                slot.local_port,
                slot.signal.clone(),
            )
        };

        if ty == SocketType::Datagram {
            let Some(mut pkt) = self.pool.get() else {
                return Err(StackError::PoolExhausted);
            };
            pkt.header_raw = PacketHeader::new(
                Priority::Normal,
                remote_node,
                local_node,
                remote_port,
                local_port as u8,
                Flags::empty(),
            )
            .pack();
            pkt.set_data(data);
            let _ = self.router.transmit(&pkt);
            self.pool.free(pkt);
            return Ok(data.len());
        }

        let mut attempts = 0;
        while attempts < RETRY_LIMIT {
            let Some(mut pkt) = self.pool.get() else {
                // transient pool pressure does not consume a retry, only
                // an unacknowledged transmission does
                time::sleep(Duration::from_millis(10)).await;
                continue;
            };

            let tx_seq = self.sockets.lock().unwrap().slots[sock.0].tx_seq;
            pkt.header_raw = PacketHeader::new(
                Priority::Normal,
                remote_node,
                local_node,
                remote_port,
                local_port as u8,
                Flags::empty(),
            )
            .pack();
            pkt.payload[0] = tx_seq;
            pkt.payload[1..=data.len()].copy_from_slice(data);
            pkt.length = data.len() + 1;

            let _ = self.router.transmit(&pkt);
            self.pool.free(pkt);

            if time::timeout(ACK_TIMEOUT, signal.notified()).await.is_ok() {
                let mut table = self.sockets.lock().unwrap();
                let slot = &mut table.slots[sock.0];
                slot.tx_seq = slot.tx_seq.wrapping_add(1);
                return Ok(data.len());
            }
            attempts += 1;
            debug!("no ACK for sequence {}, retrying", tx_seq);
        }

        warn!("reliable send gave up after {} attempts", RETRY_LIMIT);
        Err(StackError::Timeout)
    }

    /// Receive from a connected socket into `buf`. Streams have their
    /// sequence byte stripped. Returns `Ok(0)` when the peer reset the
    /// connection.
    pub async fn recv(
        &self,
        sock: SocketId,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (ty, rx) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (slot.ty, slot.rx_rx.clone())
        };
        let mut rx = rx.lock().await;

        let item = match timeout {
            Some(limit) => time::timeout(limit, rx.recv())
                .await
                .map_err(|_| StackError::Timeout)?,
            None => rx.recv().await,
        };
        let Some(Some(pkt)) = item else {
            // the null sentinel: connection was reset
            return Ok(0);
        };

        let strip = if ty == SocketType::Stream { 1 } else { 0 };
        let n = pkt.length.saturating_sub(strip).min(buf.len());
        buf[..n].copy_from_slice(&pkt.payload[strip..strip + n]);
        self.pool.free(pkt);
        Ok(n)
    }

    /// Send a datagram to an explicit destination.
    pub fn send_to(&self, sock: SocketId, data: &[u8], dst_node: u8, dst_port: u8) -> Result<usize> {
        let (ty, local_node, local_port) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (slot.ty, slot.local_node, slot.local_port)
        };
        if ty != SocketType::Datagram {
            return Err(StackError::WrongSocketType);
        }
        if data.len() > MTU - 1 {
            return Err(StackError::InvalidArgument);
        }

        let Some(mut pkt) = self.pool.get() else {
            return Err(StackError::PoolExhausted);
        };
        pkt.header_raw = PacketHeader::new(
            Priority::Normal,
            dst_node,
            local_node,
            dst_port,
            local_port as u8,
            Flags::empty(),
        )
        .pack();
        pkt.set_data(data);
        let _ = self.router.transmit(&pkt);
        self.pool.free(pkt);
        Ok(data.len())
    }

    /// Receive a datagram and the source it came from, as
    /// `(bytes_copied, src_node, src_port)`.
    pub async fn recv_from(
        &self,
        sock: SocketId,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, u8, u8)> {
        let (ty, rx) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (slot.ty, slot.rx_rx.clone())
        };
        if ty != SocketType::Datagram {
            return Err(StackError::WrongSocketType);
        }
        let mut rx = rx.lock().await;

        let item = match timeout {
            Some(limit) => time::timeout(limit, rx.recv())
                .await
                .map_err(|_| StackError::Timeout)?,
            None => rx.recv().await,
        };
        let Some(Some(pkt)) = item else {
            return Ok((0, 0, 0));
        };

        let n = pkt.length.min(buf.len());
        buf[..n].copy_from_slice(&pkt.payload[..n]);
        let header = PacketHeader::unpack(pkt.header_raw);
        self.pool.free(pkt);
        Ok((n, header.src_node, header.src_port))
    }

    /// Close a socket. A stream socket in a handshake or established
    /// state tells its peer with an RST. The slot becomes reusable; its
    /// queues are drained when it is next allocated.
    pub fn close(&self, sock: SocketId) -> Result<()> {
        let rst = {
            let mut table = self.sockets.lock().unwrap();
            let slot = &mut table.slots[sock.0];

            let rst = (slot.ty == SocketType::Stream
                && matches!(
                    slot.state,
                    SocketState::Established | SocketState::SynSent | SocketState::SynReceived
                ))
            .then(|| ControlFrame {
                dst_node: slot.remote_node,
                dst_port: slot.remote_port,
                src_port: slot.local_port as u8,
                flags: Flags::RST,
                ack_seq: None,
            });

            slot.state = SocketState::Closed;
            slot.local_port = 0;
            rst
        };

        if let Some(frame) = rst {
            self.emit_control(frame);
        }
        Ok(())
    }
}
