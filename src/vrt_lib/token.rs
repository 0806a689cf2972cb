//! Client side of the cluster token arbitration. A node must hold the
//! token of its cluster to act as primary; the token lives on a remote
//! arbiter reached over TCP.
//!
//! The protocol is length-exact binary records: a 24-byte request
//! `{op, cluster_uuid, sender_id}` answered by a 4-byte `{result}`. On a
//! fresh connection the server sends one unsolicited reply as a greeting,
//! which the client must consume before issuing requests.

use crate::vrt_lib::desc::{EXA_MAX_NODES_NUMBER, EXA_NODEID_NONE, TOKEN_MANAGER_DEFAULT_PORT};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::uuid::ExaUuid;
use log::*;
use num_enum::TryFromPrimitive;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

/// Socket timeouts during the connection handshake
pub const TOKEN_CONNECT_TIMEOUT_MS: u64 = 200;
/// Socket timeouts once connected
pub const TOKEN_STEADY_TIMEOUT_MS: u64 = 4000;

pub const TOKEN_REQUEST_SIZE: usize = 24;
pub const TOKEN_REPLY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum TokenOp {
    Acquire = 0,
    Release = 1,
    ForceRelease = 2,
    Heartbeat = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum TokenResult {
    Accepted = 0,
    Denied = 1,
}

fn nodeid_valid(node_id: u32) -> bool {
    (node_id as usize) < EXA_MAX_NODES_NUMBER
}

/// Handle on a remote token manager. Fully synchronous; not meant to be
/// shared between threads without external locking.
pub struct TokenManager {
    address: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TokenManager {
    pub fn new(ip_addr: &str, port: u16) -> VrtResult<Self> {
        if ip_addr.parse::<IpAddr>().is_err() {
            return Err(VrtError::InvalidArg);
        }

        Ok(Self {
            address: ip_addr.to_string(),
            port: if port == 0 { TOKEN_MANAGER_DEFAULT_PORT } else { port },
            stream: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect and consume the server's greeting. Timeouts are tight for
    /// the handshake, then relaxed for steady state.
    pub fn connect(&mut self) -> VrtResult<()> {
        let addr = SocketAddr::new(self.address.parse().map_err(|_| VrtError::InvalidArg)?,
                                   self.port);

        let connect_timeout = Duration::from_millis(TOKEN_CONNECT_TIMEOUT_MS);
        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|err| {
            warn!("cannot connect to token manager {}: {}", addr, err);
            VrtError::Io
        })?;

        stream.set_read_timeout(Some(connect_timeout)).map_err(|_| VrtError::Io)?;
        stream.set_write_timeout(Some(connect_timeout)).map_err(|_| VrtError::Io)?;
        self.stream = Some(stream);

        if let Err(err) = self.receive_reply() {
            self.disconnect();
            return Err(err);
        }

        let steady_timeout = Duration::from_millis(TOKEN_STEADY_TIMEOUT_MS);
        let stream = self.stream.as_ref().unwrap();
        if stream.set_read_timeout(Some(steady_timeout)).is_err()
            || stream.set_write_timeout(Some(steady_timeout)).is_err()
        {
            self.disconnect();
            return Err(VrtError::Io);
        }

        debug!("connected to token manager {}", addr);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn send_request(&mut self, op: TokenOp, uuid: &ExaUuid, sender_id: u32) -> VrtResult<()> {
        let stream = self.stream.as_mut().ok_or(VrtError::InvalidArg)?;

        if uuid.is_zero() {
            return Err(VrtError::InvalidArg);
        }

        if !nodeid_valid(sender_id) && sender_id != EXA_NODEID_NONE {
            return Err(VrtError::InvalidArg);
        }

        /* The sender id is not used when forcefully releasing a token. This
           is the only case where sender may be EXA_NODEID_NONE. */
        if (op == TokenOp::ForceRelease) != (sender_id == EXA_NODEID_NONE) {
            return Err(VrtError::InvalidArg);
        }

        let mut req = [0u8; TOKEN_REQUEST_SIZE];
        req[0..4].copy_from_slice(&(op as u32).to_le_bytes());
        req[4..20].copy_from_slice(&uuid.to_bytes());
        req[20..24].copy_from_slice(&sender_id.to_le_bytes());

        let mut sent = 0;
        while sent < req.len() {
            match stream.write(&req[sent..]) {
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("token request send failed: {}", err);
                    return Err(VrtError::Io);
                }
            }
        }

        Ok(())
    }

    fn receive_reply(&mut self) -> VrtResult<()> {
        let stream = self.stream.as_mut().ok_or(VrtError::InvalidArg)?;

        let mut reply = [0u8; TOKEN_REPLY_SIZE];
        let mut received = 0;
        while received < reply.len() {
            match stream.read(&mut reply[received..]) {
                Ok(0) => return Err(VrtError::ConnReset),
                Ok(n) => received += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("token reply receive failed: {}", err);
                    return Err(VrtError::Io);
                }
            }
        }

        let raw = u32::from_le_bytes(reply);
        match TokenResult::try_from(raw) {
            Ok(TokenResult::Accepted) => Ok(()),
            Ok(TokenResult::Denied) => Err(VrtError::NotFound),
            Err(_) => {
                error!("token manager sent an invalid result {}", raw);
                Err(VrtError::Io)
            }
        }
    }

    /// Request (acquire) the token. The caller holds the token *iff* the
    /// call succeeds.
    pub fn request_token(&mut self, uuid: &ExaUuid, node_id: u32) -> VrtResult<()> {
        self.send_request(TokenOp::Acquire, uuid, node_id)?;
        self.receive_reply()
    }

    /// Release the token
    pub fn release_token(&mut self, uuid: &ExaUuid, node_id: u32) -> VrtResult<()> {
        self.send_request(TokenOp::Release, uuid, node_id)?;
        self.receive_reply()
    }

    /// Forcefully release a token on behalf of no node in particular
    pub fn force_token_release(&mut self, uuid: &ExaUuid) -> VrtResult<()> {
        self.send_request(TokenOp::ForceRelease, uuid, EXA_NODEID_NONE)?;
        self.receive_reply()
    }

    /// Probe the connection's liveness with a heartbeat. An idle socket
    /// that turns out readable means the peer closed it.
    pub fn check_connection(&mut self, uuid: &ExaUuid, node_id: u32) -> VrtResult<()> {
        let stream = self.stream.as_mut().ok_or(VrtError::InvalidArg)?;

        stream.set_nonblocking(true).map_err(|_| VrtError::Io)?;
        let mut probe = [0u8; 1];
        let readable = match stream.peek(&mut probe) {
            Ok(_) => true,
            Err(err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        stream.set_nonblocking(false).map_err(|_| VrtError::Io)?;

        /* This socket is not supposed to be readable, so if it is, it means
         * it's been closed. */
        if readable {
            return Err(VrtError::BadFd);
        }

        self.send_request(TokenOp::Heartbeat, uuid, node_id)?;
        self.receive_reply()
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Fake arbiter: greets every connection, then answers each request
    /// with the scripted results (Acquire from node 3 is denied when
    /// `deny_node_3`). Hangs up after `hangup_after` requests, if set.
    fn spawn_fake_server(deny_node_3: bool, hangup_after: Option<usize>)
                         -> (u16, thread::JoinHandle<Vec<(u32, u32)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let mut seen = vec![];
            let (mut socket, _) = listener.accept().unwrap();

            // Greeting
            socket.write_all(&(TokenResult::Accepted as u32).to_le_bytes()).unwrap();

            let mut req = [0u8; TOKEN_REQUEST_SIZE];
            while socket.read_exact(&mut req).is_ok() {
                let op = u32::from_le_bytes(req[0..4].try_into().unwrap());
                let sender = u32::from_le_bytes(req[20..24].try_into().unwrap());
                seen.push((op, sender));

                let result = if deny_node_3 && op == TokenOp::Acquire as u32 && sender == 3 {
                    TokenResult::Denied
                } else {
                    TokenResult::Accepted
                };
                socket.write_all(&(result as u32).to_le_bytes()).unwrap();

                if hangup_after == Some(seen.len()) {
                    break;
                }
            }
            seen
        });

        (port, handle)
    }

    #[test]
    fn handshake_request_and_heartbeat() -> VrtResult<()> {
        let (port, server) = spawn_fake_server(false, None);
        let uuid = ExaUuid::new(1, 2, 3, 4);

        let mut tm = TokenManager::new("127.0.0.1", port)?;
        assert!(!tm.is_connected());
        tm.connect()?;
        assert!(tm.is_connected());

        tm.request_token(&uuid, 3)?;
        tm.check_connection(&uuid, 3)?;
        tm.release_token(&uuid, 3)?;
        tm.force_token_release(&uuid)?;

        tm.disconnect();
        let seen = server.join().unwrap();
        assert_eq!(seen, vec![
            (TokenOp::Acquire as u32, 3),
            (TokenOp::Heartbeat as u32, 3),
            (TokenOp::Release as u32, 3),
            (TokenOp::ForceRelease as u32, EXA_NODEID_NONE),
        ]);
        Ok(())
    }

    #[test]
    fn denied_token_maps_to_enoent() -> VrtResult<()> {
        let (port, server) = spawn_fake_server(true, None);
        let uuid = ExaUuid::new(1, 2, 3, 4);

        let mut tm = TokenManager::new("127.0.0.1", port)?;
        tm.connect()?;

        assert_eq!(tm.request_token(&uuid, 3), Err(VrtError::NotFound));
        // Another node still gets the token
        tm.request_token(&uuid, 4)?;

        tm.disconnect();
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn closed_peer_is_detected_by_check_connection() -> VrtResult<()> {
        let (port, server) = spawn_fake_server(false, Some(2));
        let uuid = ExaUuid::new(1, 2, 3, 4);

        let mut tm = TokenManager::new("127.0.0.1", port)?;
        tm.connect()?;
        tm.request_token(&uuid, 1)?;

        // Drop the server side entirely
        tm.send_request(TokenOp::Heartbeat, &uuid, 1)?;
        tm.receive_reply()?;
        drop(server);

        // Give the peer a moment to tear the connection down
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tm.check_connection(&uuid, 1), Err(VrtError::BadFd));
        Ok(())
    }

    #[test]
    fn request_argument_validation() -> VrtResult<()> {
        let (port, _server) = spawn_fake_server(false, None);
        let uuid = ExaUuid::new(1, 2, 3, 4);

        let mut tm = TokenManager::new("127.0.0.1", port)?;
        tm.connect()?;

        // A zero uuid and an unset sender are invalid
        assert_eq!(tm.request_token(&ExaUuid::default(), 1), Err(VrtError::InvalidArg));
        assert_eq!(tm.send_request(TokenOp::Acquire, &uuid, EXA_NODEID_NONE),
                   Err(VrtError::InvalidArg));
        assert_eq!(tm.send_request(TokenOp::ForceRelease, &uuid, 1),
                   Err(VrtError::InvalidArg));
        assert_eq!(tm.send_request(TokenOp::Acquire, &uuid, 500),
                   Err(VrtError::InvalidArg));
        Ok(())
    }

    #[test]
    fn bad_address_is_rejected_at_init() {
        assert!(TokenManager::new("not-an-ip", 0).is_err());
        assert!(TokenManager::new("127.0.0.1", 0).is_ok());
    }

    #[test]
    fn operations_require_a_connection() {
        let uuid = ExaUuid::new(1, 2, 3, 4);
        let mut tm = TokenManager::new("127.0.0.1", 1).unwrap();
        assert_eq!(tm.request_token(&uuid, 1), Err(VrtError::InvalidArg));
    }
}
