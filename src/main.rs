//! Orchestrator (grounded on
//! `examples/original_source/aidentd.c`'s `main` and `apps/ogaki/src/main.rs`'s
//! top-level error dispatch).

mod cli;
mod conntrack;
mod deadline;
mod error;
mod forward;
mod logging;
mod netlink;
mod privileges;
mod query;

use std::io::{self, Write};
use std::os::fd::AsRawFd;

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};

use cli::Cli;
use deadline::Deadline;
use error::Error;
use query::IdentQuery;

fn main() {
    let cli = Cli::parse();
    logging::init("identd", !cli.log_stderr, cli.verbosity());

    // The forward socket can have its peer reset mid-write; die on EPIPE
    // rather than SIGPIPE, same as any other well-behaved network daemon.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    match run(&cli) {
        Ok(()) => {}
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let deadline = Deadline::new(cli.timeout);

    let need_admin = !cli.local_only;

    if !cli.keep_privileges {
        let identity = privileges::resolve_identity(cli.user.as_deref(), cli.group.as_deref())?;
        if need_admin {
            privileges::set_file_capabilities(&cli.conntrack_path)?;
        }
        privileges::minimal_privileges(&identity, cli.keep_privileges, need_admin)?;
    }

    let peer_addr = peer_address(cli.validate_ip);

    let mut line = String::new();
    wait_for_query_line(&deadline)?;
    io::stdin().read_line(&mut line).map_err(Error::Io)?;

    let parsed = match query::parse_query(&line, cli.accept_ip) {
        Some(parsed) => parsed,
        None => return emit_error(&line, Error::InvalidPort.wire_token()),
    };
    let mut query = parsed.query;
    if cli.validate_ip && query.peer_addr.is_none() {
        query.peer_addr = peer_addr;
    }

    if parsed.got_address {
        log::info!(
            "ident query: our port {} to remote port {} (forwarded from {})",
            query.local_port,
            query.remote_port,
            query.peer_addr_text().unwrap_or_default(),
        );
    } else {
        log::info!(
            "ident query: our port {} to remote port {}",
            query.local_port,
            query.remote_port,
        );
    }

    let response = resolve_response(cli, &query, &deadline);
    emit_response(&query, response)
}

/// Wait until stdin has a query line ready to read, or the deadline
/// elapses. A blocking `read_line` with no timeout is how the original
/// reads its query too, but it relies on `SIGALRM` to interrupt a stalled
/// client; this crate's signal-free deadline model (see `deadline.rs`)
/// needs the wait itself bounded instead.
fn wait_for_query_line(deadline: &Deadline) -> Result<(), Error> {
    let Some(remaining) = deadline.remaining() else {
        return Ok(());
    };
    let mut sources = popol::Sources::with_capacity(1);
    sources.register((), &io::stdin(), popol::interest::READ);
    let mut events = Vec::with_capacity(1);
    match sources.poll(&mut events, popol::Timeout::from(Some(remaining))) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Expired),
        Err(e) => Err(Error::Io(e)),
    }
}

/// The peer's address, as `getpeername(2)` would report it for the
/// connection inherited on stdin. Used to validate (or default) the query's
/// own claimed peer address. A failure here (e.g. not run from inetd) is
/// only a warning when `validate_ip` was requested; otherwise it's routine
/// enough to log at debug level.
fn peer_address(validate_ip: bool) -> Option<std::net::IpAddr> {
    let fd = io::stdin().as_raw_fd();
    let storage: nix::sys::socket::SockaddrStorage = match nix::sys::socket::getpeername(fd) {
        Ok(storage) => storage,
        Err(e) => {
            if validate_ip {
                log::warn!("getpeername failed (not run from inetd?): {e}");
            } else {
                log::debug!("getpeername failed (not run from inetd?): {e}");
            }
            return None;
        }
    };
    if let Some(v4) = storage.as_sockaddr_in() {
        Some(std::net::IpAddr::V4(v4.ip()))
    } else {
        storage.as_sockaddr_in6().map(|v6| std::net::IpAddr::V6(v6.ip()))
    }
}

enum Resolution {
    Local { user_name: String },
    Forwarded(forward::ForwardedReply),
    NoUser,
    HiddenUser,
    DoNotRespond,
}

fn resolve_response(cli: &Cli, query: &IdentQuery, deadline: &Deadline) -> Result<Resolution, Error> {
    if let Some(found) = netlink::resolve(query, cli.validate_ip, deadline)? {
        let name = found
            .user_name
            .unwrap_or_else(|| found.uid.to_string());
        return Ok(Resolution::Local { user_name: name });
    }

    if !cli.local_only {
        if let Some(nat) = conntrack::resolve(&cli.conntrack_path, query, deadline)? {
            let mut forward_query = query.clone();
            forward_query.local_port = nat.origin_port;
            forward_query.extension_in_effect = cli.forward_ip;
            if cli.forward_ip {
                forward_query.peer_addr = query.peer_addr;
            }

            // A forward was attempted, so the fixed-local override below
            // does not apply even if it comes back empty: that override
            // only covers queries nobody else claimed responsibility for.
            return match forward::forward(nat.origin_addr, &forward_query, deadline) {
                Ok(Some(reply)) => Ok(Resolution::Forwarded(reply)),
                Ok(None) => Ok(Resolution::NoUser),
                Err(Error::Expired) => Err(Error::Expired),
                Err(_) => Ok(Resolution::NoUser),
            };
        }
    }

    match cli.fixed_local.as_deref() {
        Some("!") => Ok(Resolution::DoNotRespond),
        Some("*") => Ok(Resolution::NoUser),
        Some("?") => Ok(Resolution::HiddenUser),
        Some(fixed) => Ok(Resolution::Local {
            user_name: fixed.to_string(),
        }),
        None => Ok(Resolution::NoUser),
    }
}

fn emit_response(query: &IdentQuery, resolution: Result<Resolution, Error>) -> Result<(), Error> {
    let mut stdout = io::stdout();
    if let Some(line) = format_response(query, resolution) {
        write!(stdout, "{line}").map_err(Error::Io)?;
    }
    stdout.flush().map_err(Error::Io)
}

/// Render a resolution as the RFC 1413 line it produces, or `None` for the
/// fixed-local `!` override, which answers nothing at all. Split out from
/// `emit_response` so the wire formatting can be exercised without needing
/// a live stdout.
fn format_response(query: &IdentQuery, resolution: Result<Resolution, Error>) -> Option<String> {
    let prefix = format!("{},{}", query.local_port, query.remote_port);

    match resolution {
        Ok(Resolution::Local { user_name }) => Some(format!("{prefix}:USERID:UNIX:{user_name}\r\n")),
        Ok(Resolution::Forwarded(reply)) => Some(format!("{prefix}:{}\r\n", reply.raw_fields)),
        Ok(Resolution::NoUser) => Some(format!("{prefix}:ERROR:NO-USER\r\n")),
        Ok(Resolution::HiddenUser) => Some(format!("{prefix}:ERROR:HIDDEN-USER\r\n")),
        Ok(Resolution::DoNotRespond) => None,
        Err(Error::Expired) => Some(format!("{prefix}:ERROR:{}\r\n", Error::Expired.wire_token())),
        Err(err) => {
            log::warn!("lookup failed: {err}");
            Some(format!("{prefix}:ERROR:{}\r\n", err.wire_token()))
        }
    }
}

fn emit_error(line: &str, token: &str) -> Result<(), Error> {
    log::debug!("could not parse query line: {line:?}");
    write!(io::stdout(), "{}", format_error_line(token)).map_err(Error::Io)?;
    io::stdout().flush().map_err(Error::Io)
}

/// The invalid-query response: the port pair is unknown, so the prefix is
/// always `0,0` rather than whatever garbage preceded the parse failure.
fn format_error_line(token: &str) -> String {
    format!("0,0:ERROR:{token}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(local: u16, remote: u16) -> IdentQuery {
        IdentQuery::new(local, remote)
    }

    // Spec scenario 1: a plain local lookup succeeds.
    #[test]
    fn formats_a_local_userid_response() {
        let resolution = Ok(Resolution::Local {
            user_name: "alice".to_string(),
        });
        let line = format_response(&query(22, 34567), resolution).unwrap();
        assert_eq!(line, "22,34567:USERID:UNIX:alice\r\n");
    }

    // Spec scenario 4: a forwarded reply is re-emitted verbatim, including
    // a downstream's own hidden-user error.
    #[test]
    fn passes_through_a_forwarded_hidden_user_error() {
        let resolution = Ok(Resolution::Forwarded(forward::ForwardedReply {
            raw_fields: "ERROR:HIDDEN-USER".to_string(),
        }));
        let line = format_response(&query(34567, 113), resolution).unwrap();
        assert_eq!(line, "34567,113:ERROR:HIDDEN-USER\r\n");
    }

    // Spec scenario 5: the fixed-local `*` override answers NO-USER.
    #[test]
    fn no_user_resolution_formats_as_no_user_error() {
        let line = format_response(&query(22, 34567), Ok(Resolution::NoUser)).unwrap();
        assert_eq!(line, "22,34567:ERROR:NO-USER\r\n");
    }

    #[test]
    fn hidden_user_resolution_formats_as_hidden_user_error() {
        let line = format_response(&query(22, 34567), Ok(Resolution::HiddenUser)).unwrap();
        assert_eq!(line, "22,34567:ERROR:HIDDEN-USER\r\n");
    }

    // Spec scenario: the fixed-local `!` override answers nothing.
    #[test]
    fn do_not_respond_resolution_emits_no_line() {
        assert!(format_response(&query(22, 34567), Ok(Resolution::DoNotRespond)).is_none());
    }

    #[test]
    fn expired_deadline_formats_as_unknown_error() {
        let line = format_response(&query(22, 34567), Err(Error::Expired)).unwrap();
        assert_eq!(line, "22,34567:ERROR:UNKNOWN-ERROR\r\n");
    }

    #[test]
    fn invalid_query_error_line_uses_zero_prefix() {
        assert_eq!(format_error_line("INVALID-PORT"), "0,0:ERROR:INVALID-PORT\r\n");
    }
}
