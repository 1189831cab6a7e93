//! Command-line surface, modeled as a single `clap::Parser`
//! struct in the style of `apps/ogaki`'s `Cli`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "identd",
    version,
    about = "RFC 1413 ident responder with NAT-forwarding support",
    long_about = "Intended to be run by inetd/xinetd; the query is read from stdin and the \
                  response written to stdout."
)]
pub struct Cli {
    /// Require the destination IP of a local match to equal the client's
    /// peer address, not just the port pair. Do not enable this on hosts
    /// that only ever *receive* forwarded queries.
    #[arg(short = 'i', long = "validate-ip")]
    pub validate_ip: bool,

    /// Put the original peer IP in forwarded (outgoing) queries. Requires
    /// the receiving identd to be run with `--accept-ip` to be honored.
    #[arg(short = 'A', long = "forward-ip")]
    pub forward_ip: bool,

    /// Accept the non-standard IP extension in incoming queries, allowing
    /// matches by IP and not just port pair.
    #[arg(short = 'a', long = "accept-ip")]
    pub accept_ip: bool,

    /// Timeout in seconds for the whole lookup, including forwarding.
    /// 0 disables the deadline.
    #[arg(short = 't', long = "timeout", default_value_t = 5)]
    pub timeout: u64,

    /// Run as this user (name or numeric uid). Defaults to dropping root
    /// to a dedicated `identd` user, falling back to `nobody`.
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Run as this group (name or numeric gid). Defaults analogously to
    /// `--user`.
    #[arg(short = 'g', long = "group")]
    pub group: Option<String>,

    /// Keep uid/gid and all privileges unchanged.
    #[arg(short = 'k', long = "keep-privileges")]
    pub keep_privileges: bool,

    /// Fixed response for local (non-forwarded) queries: a literal user
    /// name, `*` for `NO-USER`, `?` for `HIDDEN-USER`, or `!` to not
    /// respond at all. Only applied when no forward was attempted.
    #[arg(short = 'f', long = "fixed-local")]
    pub fixed_local: Option<String>,

    /// Disable NAT forwarding entirely (local lookups only).
    #[arg(short = 'l', long = "local-only")]
    pub local_only: bool,

    /// Path to the conntrack executable used for NAT resolution.
    #[arg(short = 'c', long = "conntrack-path", default_value = "/usr/sbin/conntrack")]
    pub conntrack_path: String,

    /// Increase logging verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease logging verbosity (repeatable).
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Log to stderr instead of syslog. Debugging only: some super-servers
    /// forward stderr to the remote client.
    #[arg(short = 'e', long = "log-stderr")]
    pub log_stderr: bool,
}

impl Cli {
    /// Net verbosity after applying `-v`/`-q`, starting from the original's
    /// default of 2 ("notice").
    pub fn verbosity(&self) -> i32 {
        2 + self.verbose as i32 - self.quiet as i32
    }
}
