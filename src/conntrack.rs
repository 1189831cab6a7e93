//! NAT traversal via the `conntrack` CLI (grounded on
//! `examples/original_source/conntrack.c`).
//!
//! Linux masquerading rewrites the locally visible port pair, so a local
//! socket lookup alone cannot identify the true origin of a forwarded
//! connection. `conntrack -L` dumps the kernel's connection tracking table,
//! and a masqueraded TCP flow shows up as two address/port pairs on its
//! "reply" line: the LAN-side tuple the origin host actually used, and the
//! external tuple the peer negotiating the query sees. We ask the kernel to
//! filter down to the one flow that matches our local port pair, then parse
//! out both `src=` tokens.

use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::process::{Command, Stdio};

use crate::deadline::Deadline;
use crate::error::Error;
use crate::query::IdentQuery;

/// The two endpoints of a masqueraded flow, read from a `conntrack -L`
/// reply line's pair of `src=` tokens.
pub struct NatMatch {
    /// The address and port the real origin host used on the LAN side.
    pub origin_addr: IpAddr,
    pub origin_port: u16,
}

/// Look up the masquerade table entry for `query`'s port pair. Returns
/// `None` if no matching entry exists (not forwarded, or already closed).
/// If the deadline expires while `conntrack` is still producing output, the
/// child is killed and `Error::Expired` is returned, same as a netlink or
/// forward timeout.
pub fn resolve(conntrack_path: &str, query: &IdentQuery, deadline: &Deadline) -> Result<Option<NatMatch>, Error> {
    let mut command = Command::new(conntrack_path);
    command
        .arg("-L")
        .arg("-p")
        .arg("tcp")
        .arg("--reply-port-src")
        .arg(query.remote_port.to_string())
        .arg("--reply-port-dst")
        .arg(query.local_port.to_string());

    if let Some(peer) = query.peer_addr {
        command.arg("--reply-src").arg(peer.to_string());
    }

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::Io)?;

    let stdout = child.stdout.take().expect("piped stdout");
    nix::fcntl::fcntl(&stdout, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let mut reader = BufReader::new(stdout);

    let result = read_matching_line(&mut reader, query, deadline);

    // Kill rather than wait indefinitely: a timed-out conntrack child has
    // already missed its window and its exit status is of no further use.
    if result.is_err() {
        let _ = child.kill();
    }
    let _ = child.wait();
    result
}

fn read_matching_line<R: std::io::Read + std::os::fd::AsRawFd>(
    reader: &mut BufReader<R>,
    query: &IdentQuery,
    deadline: &Deadline,
) -> Result<Option<NatMatch>, Error> {
    loop {
        if deadline.has_expired() {
            return Err(Error::Expired);
        }

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(None), // conntrack exited, table scan done
            Ok(_) => {
                let line = line.trim_end();
                if let Some(candidate) = parse_reply_line(line) {
                    // The reply tuple is what the upstream server actually sees: its
                    // source port must be our remote port, and the masquerade port it
                    // replies to must be our local port. conntrack's own filter args
                    // already narrow to this, so this re-check only guards against a
                    // tool that ignored the filter.
                    if candidate.reply_src_port != query.remote_port || candidate.reply_dst_port != query.local_port {
                        continue;
                    }
                    // A flow whose "NATed" origin is the router's own address isn't
                    // forwarded anywhere; it would already have resolved locally.
                    if candidate.origin_addr == candidate.router_dst {
                        log::debug!("ignoring self-loop conntrack entry: {line}");
                        continue;
                    }
                    if let Some(peer) = query.peer_addr {
                        if peer.to_string() != candidate.reply_addr.to_string() {
                            log::info!(
                                "conntrack reply-side address {} disagrees with query peer {peer}; accepting anyway",
                                candidate.reply_addr,
                            );
                        }
                    }
                    return Ok(Some(NatMatch {
                        origin_addr: candidate.origin_addr,
                        origin_port: candidate.origin_port,
                    }));
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(remaining) = deadline.remaining() {
                    let mut sources = popol::Sources::with_capacity(1);
                    sources.register((), reader.get_ref(), popol::interest::READ);
                    let mut events = Vec::with_capacity(1);
                    match sources.poll(&mut events, popol::Timeout::from(Some(remaining))) {
                        Ok(_) => continue,
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(Error::Expired),
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// One `conntrack -L` output line, split at its second `src=` token into
/// the LAN-side original tuple and the reply tuple that was NATed.
struct ReplyLine {
    /// LAN side `src=`: the client's real address.
    origin_addr: IpAddr,
    /// LAN side `sport=`: the client's real source port.
    origin_port: u16,
    /// Reply side `src=`: the upstream server's address.
    reply_addr: IpAddr,
    /// Reply side `dst=`: the router's own address, the one the server
    /// actually sees as the connecting client.
    router_dst: IpAddr,
    /// Reply side `sport=`: the upstream server's port.
    reply_src_port: u16,
    /// Reply side `dport=`: the router-assigned masquerade port.
    reply_dst_port: u16,
}

/// Parse one `conntrack -L` output line. Lines without two `src=` tokens
/// (one for the LAN-side original tuple, one for the reply tuple) aren't a
/// masqueraded flow conntrack can tell us anything about and are skipped.
fn parse_reply_line(line: &str) -> Option<ReplyLine> {
    let mut seen_src = 0;
    let (mut origin_addr, mut origin_port) = (None, None);
    let (mut reply_addr, mut router_dst, mut reply_src_port, mut reply_dst_port) = (None, None, None, None);

    for field in line.split_whitespace() {
        if let Some(value) = field.strip_prefix("src=") {
            seen_src += 1;
            let addr = value.parse::<IpAddr>().ok();
            if seen_src == 1 {
                origin_addr = addr;
            } else {
                reply_addr = addr;
            }
            continue;
        }
        if seen_src < 2 {
            if let Some(value) = field.strip_prefix("sport=") {
                origin_port = origin_port.or(value.parse::<u16>().ok());
            }
            continue;
        }
        if let Some(value) = field.strip_prefix("dst=") {
            router_dst = value.parse::<IpAddr>().ok();
        } else if let Some(value) = field.strip_prefix("sport=") {
            reply_src_port = value.parse::<u16>().ok();
        } else if let Some(value) = field.strip_prefix("dport=") {
            reply_dst_port = value.parse::<u16>().ok();
        }
    }

    Some(ReplyLine {
        origin_addr: origin_addr?,
        origin_port: origin_port?,
        reply_addr: reply_addr?,
        router_dst: router_dst?,
        reply_src_port: reply_src_port?,
        reply_dst_port: reply_dst_port?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_src_tokens_and_the_lan_side_port() {
        let line = "tcp 6 431999 ESTABLISHED src=10.0.0.5 dst=93.184.216.34 sport=51413 dport=443 \
                     src=93.184.216.34 dst=203.0.113.7 sport=443 dport=40000 [ASSURED]";
        let parsed = parse_reply_line(line).unwrap();
        assert_eq!(parsed.origin_addr, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.origin_port, 51413);
        assert_eq!(parsed.reply_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.router_dst, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.reply_src_port, 443);
        assert_eq!(parsed.reply_dst_port, 40000);
    }

    #[test]
    fn rejects_a_line_missing_the_second_src_token() {
        let line = "tcp 6 431999 ESTABLISHED src=10.0.0.5 dst=93.184.216.34 sport=51413 dport=443";
        assert!(parse_reply_line(line).is_none());
    }

    fn sample_line(client_addr: &str, client_port: u16, router_dst: &str, reply_sport: u16, reply_dport: u16) -> String {
        format!(
            "tcp 6 431999 ESTABLISHED src={client_addr} dst=198.51.100.10 sport={client_port} dport=443 \
             src=203.0.113.2 dst={router_dst} sport={reply_sport} dport={reply_dport} [ASSURED]"
        )
    }

    #[test]
    fn accepts_the_scenario_from_the_end_to_end_walkthrough() {
        // §8 scenario 3: query is 34567,443; the matching row names the LAN
        // client as 192.168.1.5:51000.
        let query = IdentQuery {
            local_port: 34567,
            remote_port: 443,
            ..IdentQuery::default()
        };
        let line = sample_line("192.168.1.5", 51000, "198.51.100.10", 443, 34567);
        let parsed = parse_reply_line(&line).unwrap();
        assert_eq!(parsed.reply_dst_port, query.local_port);
        assert_eq!(parsed.reply_src_port, query.remote_port);
        assert_ne!(parsed.origin_addr, parsed.router_dst);
        assert_eq!(parsed.origin_addr, "192.168.1.5".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.origin_port, 51000);
    }

    #[test]
    fn rejects_a_row_whose_reply_ports_do_not_match_the_query() {
        let query = IdentQuery {
            local_port: 34567,
            remote_port: 443,
            ..IdentQuery::default()
        };
        let line = sample_line("192.168.1.5", 51000, "198.51.100.10", 443, 9999);
        let parsed = parse_reply_line(&line).unwrap();
        assert_ne!(parsed.reply_dst_port, query.local_port);
    }

    #[test]
    fn flags_a_self_loop_row() {
        // The "NATed" origin is the router's own address: not forwardable.
        let line = sample_line("198.51.100.10", 51000, "198.51.100.10", 443, 34567);
        let parsed = parse_reply_line(&line).unwrap();
        assert_eq!(parsed.origin_addr, parsed.router_dst);
    }
}
