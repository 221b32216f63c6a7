//! Text transforms over the proxy's per-user configuration fragments
//!
//! A fragment holds one outbound-address directive per port:
//!
//! ```text
//! tcp_outgoing_address 100.64.0.7 user_ana port1000
//! tcp_outgoing_address 100.64.0.9 user_ana port1001
//! ```
//!
//! Everything here is pure text manipulation so it can be tested without a
//! remote host. Rewrites work on raw bytes: they touch exactly one line and
//! leave every other byte of the fragment as it was, line endings and
//! non-UTF-8 comments included.

use std::collections::BTreeMap;
use std::net::IpAddr;

use thiserror::Error;

/// Directive keyword rewritten during a rotation
pub const OUTBOUND_DIRECTIVE: &str = "tcp_outgoing_address";

/// Failure to locate the directive to rewrite
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("no {OUTBOUND_DIRECTIVE} line for port{0}")]
    DirectiveMissing(u16),

    #[error("{count} {OUTBOUND_DIRECTIVE} lines for port{port}, expected exactly one")]
    DirectiveAmbiguous { port: u16, count: usize },
}

/// One parsed outbound-address directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDirective {
    pub address: IpAddr,
    pub username: String,
    pub port: u16,
}

/// Render the directive binding `port` to `address` for `username`
pub fn directive_line(address: IpAddr, username: &str, port: u16) -> String {
    format!("{OUTBOUND_DIRECTIVE} {address} user_{username} port{port}")
}

/// Rewrite the directive of one port inside a fragment
///
/// The matching line must start with the directive keyword and end with the
/// exact token `port<N>`; `port1000` never matches `port10001`. Exactly one
/// line must match.
pub fn rewrite_outbound_address(
    content: &[u8],
    port: u16,
    address: IpAddr,
    username: &str,
) -> Result<Vec<u8>, FragmentError> {
    let mut out = Vec::with_capacity(content.len() + 16);
    let mut matches = 0usize;

    for line in content.split_inclusive(|&b| b == b'\n') {
        let (body, ending) = split_line_ending(line);
        if directive_port(body) == Some(port) {
            matches += 1;
            let indent_len = body.iter().take_while(|b| b.is_ascii_whitespace()).count();
            out.extend_from_slice(&body[..indent_len]);
            out.extend_from_slice(directive_line(address, username, port).as_bytes());
            out.extend_from_slice(ending);
        } else {
            out.extend_from_slice(line);
        }
    }

    match matches {
        0 => Err(FragmentError::DirectiveMissing(port)),
        1 => Ok(out),
        count => Err(FragmentError::DirectiveAmbiguous { port, count }),
    }
}

/// Parse every well-formed outbound directive in a fragment
pub fn parse_outbound_directives(content: &str) -> Vec<OutboundDirective> {
    content
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 || tokens[0] != OUTBOUND_DIRECTIVE {
                return None;
            }
            let address = tokens[1].parse().ok()?;
            let username = tokens[2].strip_prefix("user_")?.to_string();
            let port = parse_port_token(tokens[tokens.len() - 1])?;
            Some(OutboundDirective {
                address,
                username,
                port,
            })
        })
        .collect()
}

/// Parse the ACL file into proxy username -> port numbers
///
/// Lines look like `acl ana_ports myportname port1000 port1001`.
pub fn parse_acl_user_ports(content: &str) -> BTreeMap<String, Vec<u16>> {
    let mut users = BTreeMap::new();

    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 || tokens[0] != "acl" || tokens[2] != "myportname" {
            continue;
        }
        let Some(username) = tokens[1].strip_suffix("_ports") else {
            continue;
        };
        if username.is_empty() {
            continue;
        }
        let ports = tokens[3..]
            .iter()
            .filter_map(|token| parse_port_token(token))
            .collect();
        users.insert(username.to_string(), ports);
    }

    users
}

/// Whether validator output reports a fatal or error condition
///
/// Only a message that starts with `FATAL` or `ERROR` (any case) counts. The
/// message is what follows the `| ` after squid's timestamp, or the whole
/// line without one. Echoed configuration lines (`Processing: ...`) can
/// contain the markers inside user names and never count.
pub fn validation_rejected(output: &str) -> bool {
    output.lines().any(|line| {
        let message = match line.split_once("| ") {
            Some((_, message)) => message,
            None => line,
        }
        .trim_start();
        starts_with_ignore_case(message, "fatal") || starts_with_ignore_case(message, "error")
    })
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn directive_port(body: &[u8]) -> Option<u16> {
    let mut tokens = body
        .split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty());
    if tokens.next()? != OUTBOUND_DIRECTIVE.as_bytes() {
        return None;
    }
    parse_port_token(std::str::from_utf8(tokens.last()?).ok()?)
}

fn parse_port_token(token: &str) -> Option<u16> {
    let digits = token.strip_prefix("port")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn split_line_ending(line: &[u8]) -> (&[u8], &[u8]) {
    if let Some(body) = line.strip_suffix(b"\r\n") {
        (body, &b"\r\n"[..])
    } else if let Some(body) = line.strip_suffix(b"\n") {
        (body, &b"\n"[..])
    } else {
        (line, &b""[..])
    }
}
