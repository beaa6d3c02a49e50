use std::fmt;

use util::ArcStr;

use crate::error::{Error, Result};
use crate::message::SipMethod;
use crate::transaction::Role;
use crate::transport::{IncomingRequest, OutgoingRequest};

const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates a new branch parameter: the RFC 3261 magic cookie followed by
/// a token unique for the lifetime of the process.
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, uuid::Uuid::new_v4().simple())
}

/// Returns `true` when `branch` carries the RFC 3261 magic cookie.
pub fn has_magic_cookie(branch: &str) -> bool {
    branch.starts_with(BRANCH_MAGIC_COOKIE)
}

/// Guarantees the top Via of an outbound request carries an RFC 3261
/// branch, generating one when the caller supplied none.
pub(crate) fn ensure_branch(request: &mut OutgoingRequest) -> Result<()> {
    let via = request
        .msg
        .headers
        .via_mut()
        .ok_or(Error::MissingRequiredHeader("Via"))?;

    match via.branch() {
        Some(branch) if has_magic_cookie(branch) => {}
        _ => {
            let branch = generate_branch();
            log::trace!("Generated branch {branch}");
            via.branch = Some(branch.into());
        }
    }

    Ok(())
}

// The method is part of the key except for INVITE and ACK, which must land
// on the same transaction (RFC 3261 §17.2.3).
fn key_method(method: SipMethod) -> Option<SipMethod> {
    match method {
        SipMethod::Invite | SipMethod::Ack => None,
        other => Some(other),
    }
}

/// The identity of a transaction inside the registry.
///
/// Two forms exist: the RFC 3261 key, derived from the branch parameter
/// when it carries the magic cookie, and the RFC 2543 fallback for requests
/// from pre-cookie peers. Every text component is ASCII-lowercased at
/// construction, so the derived `Eq` and `Hash` compare case-insensitively.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum TsxKey {
    /// The RFC 2543 fallback form.
    Rfc2543(Rfc2543),
    /// The RFC 3261 branch-based form.
    Rfc3261(Rfc3261),
}

/// The branch-based key of a cookie-carrying peer.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Rfc3261 {
    role: Role,
    method: Option<SipMethod>,
    branch: ArcStr,
}

/// The fallback key for peers whose branch lacks the magic cookie.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Rfc2543 {
    role: Role,
    method: Option<SipMethod>,
    cseq: u32,
    from_tag: ArcStr,
    call_id: ArcStr,
    via_host: ArcStr,
    via_port: u16,
}

impl TsxKey {
    /// Builds the client key for the given CSeq method and branch.
    pub fn client(method: SipMethod, branch: &str) -> Self {
        TsxKey::Rfc3261(Rfc3261 {
            role: Role::UAC,
            method: key_method(method),
            branch: ArcStr::from_lowercase(branch),
        })
    }

    /// Builds the server key for an incoming request.
    ///
    /// Uses the RFC 3261 form when the top Via branch carries the magic
    /// cookie and the RFC 2543 fallback otherwise.
    pub fn server(request: &IncomingRequest) -> Result<Self> {
        Self::server_with_method(request, *request.req_headers.cseq.method())
    }

    /// Builds a server key with an explicit method component.
    ///
    /// CANCEL and ACK must be matched against the transaction they refer
    /// to, so the caller passes the CSeq method of that transaction rather
    /// than the method of the message at hand.
    pub fn server_with_method(request: &IncomingRequest, method: SipMethod) -> Result<Self> {
        let via = &request.req_headers.via;

        match via.branch() {
            Some(branch) if has_magic_cookie(branch) => Ok(TsxKey::Rfc3261(Rfc3261 {
                role: Role::UAS,
                method: key_method(method),
                branch: ArcStr::from_lowercase(branch),
            })),
            _ => {
                let from_tag = request
                    .req_headers
                    .from
                    .tag()
                    .map(|tag| ArcStr::from_lowercase(tag))
                    .unwrap_or_default();

                Ok(TsxKey::Rfc2543(Rfc2543 {
                    role: Role::UAS,
                    method: key_method(method),
                    cseq: request.req_headers.cseq.cseq,
                    from_tag,
                    call_id: ArcStr::from_lowercase(request.req_headers.call_id.as_str()),
                    via_host: ArcStr::from_lowercase(&via.sent_by().host),
                    via_port: via.sent_by().port_or_default(),
                }))
            }
        }
    }

    /// Returns the role component of the key.
    pub(crate) fn role(&self) -> Role {
        match self {
            TsxKey::Rfc3261(key) => key.role,
            TsxKey::Rfc2543(key) => key.role,
        }
    }

    /// Prints the canonical byte string of this key.
    pub fn print(&self) -> String {
        let mut out = String::with_capacity(48);
        let (role, method) = match self {
            TsxKey::Rfc3261(key) => (key.role, key.method),
            TsxKey::Rfc2543(key) => (key.role, key.method),
        };

        out.push(if role == Role::UAC { 'c' } else { 's' });
        out.push('$');

        if let Some(method) = method {
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push('$');
        }

        match self {
            TsxKey::Rfc3261(key) => out.push_str(&key.branch),
            TsxKey::Rfc2543(key) => {
                out.push_str(&format!(
                    "{}${}${}${}:{}",
                    key.cseq, key.from_tag, key.call_id, key.via_host, key.via_port
                ));
            }
        }

        out
    }

    /// Parses a canonical key string produced by [`TsxKey::print`].
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('$');

        let role = match parts.next() {
            Some("c") => Role::UAC,
            Some("s") => Role::UAS,
            _ => return Err(Error::InvalidInput("tsx key role")),
        };

        let rest: Vec<&str> = parts.collect();
        let (method, fields) = match rest.as_slice() {
            [one] => (None, vec![*one]),
            [m, tail @ ..] if SipMethod::from_name(m).is_some() && !tail.is_empty() => {
                (SipMethod::from_name(m), tail.to_vec())
            }
            fields => (None, fields.to_vec()),
        };

        let is_branch =
            |s: &str| s.len() >= BRANCH_MAGIC_COOKIE.len() && s[..BRANCH_MAGIC_COOKIE.len()].eq_ignore_ascii_case(BRANCH_MAGIC_COOKIE);

        match fields.as_slice() {
            [branch] if is_branch(branch) => Ok(TsxKey::Rfc3261(Rfc3261 {
                role,
                method,
                branch: ArcStr::from_lowercase(branch),
            })),
            [cseq, from_tag, call_id, via] => {
                let cseq = cseq.parse().map_err(|_| Error::InvalidInput("tsx key cseq"))?;
                let (host, port) = via
                    .rsplit_once(':')
                    .ok_or(Error::InvalidInput("tsx key via"))?;
                let via_port = port.parse().map_err(|_| Error::InvalidInput("tsx key via port"))?;

                Ok(TsxKey::Rfc2543(Rfc2543 {
                    role,
                    method,
                    cseq,
                    from_tag: ArcStr::from_lowercase(from_tag),
                    call_id: ArcStr::from_lowercase(call_id),
                    via_host: ArcStr::from_lowercase(host),
                    via_port,
                }))
            }
            _ => Err(Error::InvalidInput("tsx key layout")),
        }
    }
}

impl fmt::Display for TsxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mock;

    #[test]
    fn test_client_key_case_insensitive() {
        let a = TsxKey::client(SipMethod::Options, "z9hG4bKNaShDs7");
        let b = TsxKey::client(SipMethod::Options, "z9hg4bknashds7");

        assert_eq!(a, b);
    }

    #[test]
    fn test_method_omitted_for_invite_and_ack() {
        let invite = TsxKey::client(SipMethod::Invite, "z9hG4bK42");
        let ack = TsxKey::client(SipMethod::Ack, "z9hG4bK42");

        // ACK must land on the INVITE transaction.
        assert_eq!(invite, ack);

        let options = TsxKey::client(SipMethod::Options, "z9hG4bK42");
        assert_ne!(invite, options);
    }

    #[test]
    fn test_roles_do_not_collide() {
        let request = mock::request(SipMethod::Options);
        let server = TsxKey::server(&request).unwrap();
        let client = TsxKey::client(SipMethod::Options, request.req_headers.via.branch().unwrap());

        assert_ne!(server, client);
    }

    #[test]
    fn test_print_parse_round_trip() {
        let key = TsxKey::client(SipMethod::Options, "z9hG4bK3060200");
        assert_eq!(TsxKey::parse(&key.print()).unwrap(), key);

        let key = TsxKey::client(SipMethod::Invite, "z9hG4bK3060200");
        assert_eq!(key.print(), "c$z9hg4bk3060200");
        assert_eq!(TsxKey::parse(&key.print()).unwrap(), key);

        let request = mock::request_rfc2543(SipMethod::Register);
        let key = TsxKey::server(&request).unwrap();
        assert_matches!(key, TsxKey::Rfc2543(_));
        assert_eq!(TsxKey::parse(&key.print()).unwrap(), key);
    }

    #[test]
    fn test_cancel_matches_invite_key() {
        let mut request = mock::request(SipMethod::Cancel);
        request.req_headers.cseq.method = SipMethod::Cancel;

        let cancel_target = TsxKey::server_with_method(&request, SipMethod::Invite).unwrap();

        let invite = mock::request(SipMethod::Invite);
        let invite_key = TsxKey::server(&invite).unwrap();

        assert_eq!(cancel_target, invite_key);
    }
}
