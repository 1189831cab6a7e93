//! Local socket owner lookup over `NETLINK_SOCK_DIAG` (grounded
//! on `examples/original_source/netlink.c`, which drives the older
//! `NETLINK_INET_DIAG`/`TCPDIAG_GETSOCK` request by hand over a raw
//! `AF_NETLINK` socket). `netlink-packet-sock-diag` plus `netlink-sys` give
//! the same request/response shape through typed structures instead of a
//! hand-packed `struct inet_diag_req`, so this module builds one
//! `InetRequest` per address family the caller allows and walks the dump
//! reply for an entry whose port pair (and, when the caller asked to
//! validate it, peer address) matches the live query.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_sock_diag::{
    constants::{AF_INET, AF_INET6, IPPROTO_TCP},
    inet::{ExtensionFlags, InetRequest, SocketId, StateFlags},
    SockDiagMessage,
};
use netlink_sys::{protocols::NETLINK_SOCK_DIAG, Socket, SocketAddr};
use nix::unistd::User;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::query::IdentQuery;

/// Outcome of a successful local match.
pub struct LocalMatch {
    pub uid: u32,
    pub user_name: Option<String>,
}

/// Resolve the owning uid of the local socket identified by `query`,
/// querying both address families the kernel knows about. When
/// `validate_ip` is set and the query carried a peer address, an entry is
/// only accepted if its destination address also matches.
pub fn resolve(query: &IdentQuery, validate_ip: bool, deadline: &Deadline) -> Result<Option<LocalMatch>, Error> {
    for family in [AF_INET, AF_INET6] {
        if let Some(found) = query_family(family, query, validate_ip, deadline)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn query_family(
    family: u8,
    query: &IdentQuery,
    validate_ip: bool,
    deadline: &Deadline,
) -> Result<Option<LocalMatch>, Error> {
    let mut socket = Socket::new(NETLINK_SOCK_DIAG).map_err(Error::Io)?;
    socket.bind_auto().map_err(Error::Io)?;
    socket.connect(&SocketAddr::new(0, 0)).map_err(Error::Io)?;

    if let Some(remaining) = deadline.remaining() {
        socket.set_non_blocking(true).map_err(Error::Io)?;
        wait_writable(&socket, remaining)?;
    }

    let socket_id = match query.peer_addr {
        Some(IpAddr::V4(_)) if family == AF_INET => SocketId::new_v4(),
        Some(IpAddr::V6(_)) if family == AF_INET6 => SocketId::new_v6(),
        Some(_) => return Ok(None),
        None if family == AF_INET => SocketId::new_v4(),
        None => SocketId::new_v6(),
    };

    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    let mut packet = NetlinkMessage::new(
        header,
        SockDiagMessage::InetRequest(InetRequest {
            family,
            protocol: IPPROTO_TCP,
            extensions: ExtensionFlags::empty(),
            states: StateFlags::all(),
            socket_id,
        })
        .into(),
    );
    packet.finalize();

    let mut buf = vec![0u8; packet.header.length as usize];
    packet.serialize(&mut buf[..]);
    socket.send(&buf[..], 0).map_err(Error::Io)?;

    let mut receive_buffer = vec![0u8; 8192];
    loop {
        if deadline.has_expired() {
            return Err(Error::Expired);
        }
        if let Some(remaining) = deadline.remaining() {
            wait_readable(&socket, remaining)?;
        }

        let size = match socket.recv(&mut &mut receive_buffer[..], 0) {
            Ok(size) => size,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(Error::Io(e)),
        };

        let mut offset = 0;
        loop {
            let bytes = &receive_buffer[offset..size];
            let rx = <NetlinkMessage<SockDiagMessage>>::deserialize(bytes)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

            match rx.payload {
                NetlinkPayload::InnerMessage(SockDiagMessage::InetResponse(response)) => {
                    if response.header.socket_id.source_port == query.local_port
                        && response.header.socket_id.destination_port == query.remote_port
                    {
                        let addr_ok = !validate_ip
                            || query
                                .peer_addr
                                .map(|peer| peer == response.header.socket_id.destination_address)
                                .unwrap_or(true);

                        if addr_ok {
                            return Ok(Some(uid_to_match(response.header.uid)));
                        }
                    }
                }
                NetlinkPayload::Done(_) => return Ok(None),
                NetlinkPayload::Noop | NetlinkPayload::Error(_) | NetlinkPayload::Overrun(_) => {}
                _ => return Ok(None),
            }

            offset += rx.header.length as usize;
            if offset >= size || rx.header.length == 0 {
                break;
            }
        }
    }
}

fn uid_to_match(uid: u32) -> LocalMatch {
    let user_name = User::from_uid(uid.into())
        .ok()
        .flatten()
        .map(|user| user.name);
    LocalMatch { uid, user_name }
}

fn wait_readable(socket: &Socket, timeout: Duration) -> Result<(), Error> {
    wait_for(socket, timeout, popol::interest::READ)
}

fn wait_writable(socket: &Socket, timeout: Duration) -> Result<(), Error> {
    wait_for(socket, timeout, popol::interest::WRITE)
}

fn wait_for(socket: &Socket, timeout: Duration, interest: popol::Interest) -> Result<(), Error> {
    let mut sources = popol::Sources::with_capacity(1);
    sources.register((), socket, interest);
    let mut events = Vec::with_capacity(1);
    match sources.poll(&mut events, popol::Timeout::from(Some(timeout))) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Expired),
        Err(e) => Err(Error::Io(e)),
    }
}
