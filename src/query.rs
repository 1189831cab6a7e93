//! The live query and its RFC 1413 wire parser.

use std::net::IpAddr;

/// A parsed ident query: the port pair plus an optional peer address used
/// either to disambiguate a local lookup or to carry the non-standard IP
/// extension to a downstream host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentQuery {
    pub local_port: u16,
    pub remote_port: u16,
    pub peer_addr: Option<IpAddr>,
    /// On input: whether an IP extension was accepted from the caller. On
    /// a forwarded query: whether to emit the extension to the downstream
    /// server.
    pub extension_in_effect: bool,
}

impl IdentQuery {
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            peer_addr: None,
            extension_in_effect: false,
        }
    }

    /// The canonical printable form of `peer_addr`, if any.
    pub fn peer_addr_text(&self) -> Option<String> {
        self.peer_addr.map(|addr| addr.to_string())
    }
}

/// Outcome of parsing a single incoming query line.
pub struct ParsedQuery {
    pub query: IdentQuery,
    /// Whether the optional IP extension was present and well-formed.
    pub got_address: bool,
}

/// Parse `"<lport> , <rport> [ : <ip> ]"`, lenient of leading garbage before
/// each port and of whitespace around the separators. Returns `None` if
/// either port is missing or out of `[1, 65535]`. A malformed extension
/// address is not an error: the two-port query still succeeds with
/// `got_address == false`.
pub fn parse_query(line: &str, accept_extension: bool) -> Option<ParsedQuery> {
    let bytes = line.as_bytes();
    let mut pos = 0;

    let local_port = read_port(bytes, &mut pos)?;

    while pos < bytes.len() && bytes[pos] != b',' {
        pos += 1;
    }
    if pos >= bytes.len() {
        return None;
    }
    pos += 1; // past the comma

    let remote_port = read_port(bytes, &mut pos)?;

    let mut query = IdentQuery::new(local_port, remote_port);
    let mut got_address = false;

    if accept_extension {
        if let Some(offset) = bytes[pos..].iter().position(|&b| b == b':') {
            let after_colon = pos + offset + 1;
            let rest = line[after_colon..].trim_start();
            let token = rest
                .split(|c: char| c.is_whitespace() || c.is_control())
                .next()
                .unwrap_or("");

            if !token.is_empty() {
                match token.parse::<IpAddr>() {
                    Ok(addr) => {
                        query.peer_addr = Some(addr);
                        query.extension_in_effect = true;
                        got_address = true;
                    }
                    Err(_) => {
                        log::debug!("could not parse IP from query: {token}");
                    }
                }
            }
        }
    }

    Some(ParsedQuery { query, got_address })
}

/// Read a decimal port, skipping any leading non-digit bytes. Advances
/// `pos` past the consumed digits. Returns `None` if no digits are found,
/// or the value is not in `[1, 65535]`.
fn read_port(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    while *pos < bytes.len() && !bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if start == *pos {
        return None;
    }

    let value: u32 = std::str::from_utf8(&bytes[start..*pos]).ok()?.parse().ok()?;
    if !(1..=65535).contains(&value) {
        return None;
    }
    Some(value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_query() {
        let parsed = parse_query("22 , 34567\r\n", false).unwrap();
        assert_eq!(parsed.query.local_port, 22);
        assert_eq!(parsed.query.remote_port, 34567);
        assert!(!parsed.got_address);
        assert!(parsed.query.peer_addr.is_none());
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert!(parse_query("0,34567\r\n", false).is_none());
        assert!(parse_query("22,65536\r\n", false).is_none());
    }

    #[test]
    fn rejects_missing_comma() {
        assert!(parse_query("22 34567\r\n", false).is_none());
    }

    #[test]
    fn accepts_ipv4_extension_when_enabled() {
        let parsed = parse_query("34567,443 : 192.168.1.5\r\n", true).unwrap();
        assert!(parsed.got_address);
        assert_eq!(parsed.query.peer_addr_text().as_deref(), Some("192.168.1.5"));
        assert!(parsed.query.extension_in_effect);
    }

    #[test]
    fn accepts_ipv6_extension_when_enabled() {
        let parsed = parse_query("34567,443 : ::1\r\n", true).unwrap();
        assert!(parsed.got_address);
        assert_eq!(parsed.query.peer_addr_text().as_deref(), Some("::1"));
    }

    #[test]
    fn ignores_extension_when_disabled() {
        let parsed = parse_query("34567,443 : 192.168.1.5\r\n", false).unwrap();
        assert!(!parsed.got_address);
        assert!(parsed.query.peer_addr.is_none());
    }

    #[test]
    fn malformed_extension_address_does_not_fail_the_query() {
        let parsed = parse_query("34567,443 : not-an-ip\r\n", true).unwrap();
        assert!(!parsed.got_address);
        assert!(parsed.query.peer_addr.is_none());
    }

    quickcheck::quickcheck! {
        fn in_range_ports_always_parse(lport: u16, rport: u16) -> bool {
            if lport == 0 || rport == 0 {
                return true;
            }
            let line = format!("{lport},{rport}\r\n");
            match parse_query(&line, false) {
                Some(parsed) => {
                    parsed.query.local_port == lport && parsed.query.remote_port == rport
                }
                None => false,
            }
        }
    }
}
