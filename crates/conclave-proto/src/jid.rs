//! Dual-namespace peer identifiers.
//!
//! A [`Jid`] is the parsed `user[:device]@server` form used across the core.
//! The server part selects the namespace: `s.whatsapp.net` for phone-number
//! identities (PN), `lid` for anonymized local identities (LID), plus hosted
//! variants and the group/broadcast/newsletter servers.
//!
//! # Invariants
//!
//! - Device Fidelity: `device: Some(0)` and `device: None` render differently
//!   (`user:0@server` vs `user@server`) and MUST NOT be conflated. Session
//!   addressing downstream depends on the distinction: PN→LID mapping results
//!   omit a zero device, LID→PN results always carry an explicit device.
//!
//! - Round Trip: `Jid::from_str(&jid.to_string()) == jid` for every value this
//!   module produces. Parsing additionally tolerates legacy `c.us` servers and
//!   agent-suffixed users (`user_agent:device@server`), both of which
//!   normalize away and therefore do not round-trip byte-identically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The status broadcast list identifier.
pub const STATUS_BROADCAST_USER: &str = "status";

/// Identifier namespace, keyed by the server part of a JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Server {
    /// Phone-number identity (`s.whatsapp.net`).
    Pn,
    /// Anonymized local identity (`lid`).
    Lid,
    /// Multi-party group (`g.us`).
    Group,
    /// Broadcast list, including the status list (`broadcast`).
    Broadcast,
    /// One-to-many newsletter channel (`newsletter`).
    Newsletter,
    /// Hosted companion under the PN namespace (`hosted`).
    Hosted,
    /// Hosted companion under the LID namespace (`hosted.lid`).
    HostedLid,
}

impl Server {
    /// Canonical server string for this namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pn => "s.whatsapp.net",
            Self::Lid => "lid",
            Self::Group => "g.us",
            Self::Broadcast => "broadcast",
            Self::Newsletter => "newsletter",
            Self::Hosted => "hosted",
            Self::HostedLid => "hosted.lid",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            // `c.us` is the legacy spelling of the PN server.
            "s.whatsapp.net" | "c.us" => Some(Self::Pn),
            "lid" => Some(Self::Lid),
            "g.us" => Some(Self::Group),
            "broadcast" => Some(Self::Broadcast),
            "newsletter" => Some(Self::Newsletter),
            "hosted" => Some(Self::Hosted),
            "hosted.lid" => Some(Self::HostedLid),
            _ => None,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from identifier parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    /// Input had no `@server` part or an empty user part.
    #[error("malformed jid: {input:?}")]
    Malformed {
        /// The rejected input.
        input: String,
    },

    /// Server part did not name a known namespace.
    #[error("unknown jid server: {server:?}")]
    UnknownServer {
        /// The rejected server part.
        server: String,
    },

    /// Device segment was present but not a `u16`.
    #[error("bad device segment in jid: {input:?}")]
    BadDevice {
        /// The rejected input.
        input: String,
    },
}

/// Parsed peer identifier: `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    /// User part: digits for PN identities, an opaque token for LID.
    pub user: String,
    /// Device index. `None` renders without a device segment; `Some(0)`
    /// renders as `:0`. The two are distinct identifiers on the wire.
    pub device: Option<u16>,
    /// Namespace the identifier lives in.
    pub server: Server,
}

impl Jid {
    /// Build a device-less identifier.
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self { user: user.into(), device: None, server }
    }

    /// Same identifier with an explicit device segment.
    #[must_use]
    pub fn with_device(&self, device: u16) -> Self {
        Self { user: self.user.clone(), device: Some(device), server: self.server }
    }

    /// Same identifier with the device segment dropped (user granularity).
    #[must_use]
    pub fn to_user(&self) -> Self {
        Self { user: self.user.clone(), device: None, server: self.server }
    }

    /// Effective device index: an absent segment addresses device zero.
    #[must_use]
    pub fn device_or_zero(&self) -> u16 {
        self.device.unwrap_or(0)
    }

    /// True for plain PN identities (`s.whatsapp.net`).
    #[must_use]
    pub fn is_pn_user(&self) -> bool {
        self.server == Server::Pn
    }

    /// True for plain LID identities (`lid`).
    #[must_use]
    pub fn is_lid_user(&self) -> bool {
        self.server == Server::Lid
    }

    /// True for hosted PN companions (`hosted`).
    #[must_use]
    pub fn is_hosted_pn(&self) -> bool {
        self.server == Server::Hosted
    }

    /// True for hosted LID companions (`hosted.lid`).
    #[must_use]
    pub fn is_hosted_lid(&self) -> bool {
        self.server == Server::HostedLid
    }

    /// True for any identifier in the PN namespace, hosted included.
    #[must_use]
    pub fn is_pn_shaped(&self) -> bool {
        matches!(self.server, Server::Pn | Server::Hosted)
    }

    /// True for any identifier in the LID namespace, hosted included.
    #[must_use]
    pub fn is_lid_shaped(&self) -> bool {
        matches!(self.server, Server::Lid | Server::HostedLid)
    }

    /// True for group identifiers (`g.us`).
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    /// True for broadcast lists, the status list included.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.server == Server::Broadcast
    }

    /// True for the status broadcast list specifically.
    #[must_use]
    pub fn is_status_broadcast(&self) -> bool {
        self.server == Server::Broadcast && self.user == STATUS_BROADCAST_USER
    }

    /// True for newsletter channels (`newsletter`).
    #[must_use]
    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    /// User-part equality, ignoring device and namespace spelling.
    #[must_use]
    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user
    }

    /// The `name.device` key this identifier's session record lives under.
    #[must_use]
    pub fn protocol_address(&self) -> ProtocolAddress {
        ProtocolAddress { name: self.user.clone(), device_id: self.device_or_zero() }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(device) => write!(f, "{}:{}@{}", self.user, device, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    /// Parse `user[:device]@server`.
    ///
    /// Tolerated legacy forms: `c.us` as the PN server, and an `_agent`
    /// suffix on the user part, which is dropped.
    ///
    /// # Errors
    ///
    /// - [`JidError::Malformed`] when the `@` separator or user part is missing
    /// - [`JidError::UnknownServer`] for unrecognized server parts
    /// - [`JidError::BadDevice`] when the device segment is not a `u16`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server_part) =
            s.split_once('@').ok_or_else(|| JidError::Malformed { input: s.to_string() })?;

        let server = Server::parse(server_part)
            .ok_or_else(|| JidError::UnknownServer { server: server_part.to_string() })?;

        let (user, device) = match user_part.split_once(':') {
            Some((user, device_str)) => {
                let device = device_str
                    .parse::<u16>()
                    .map_err(|_| JidError::BadDevice { input: s.to_string() })?;
                (strip_agent(user), Some(device))
            },
            None => (strip_agent(user_part), None),
        };

        if user.is_empty() {
            return Err(JidError::Malformed { input: s.to_string() });
        }

        Ok(Self { user, device, server })
    }
}

/// Strip a legacy `_agent` suffix from the user segment.
fn strip_agent(segment: &str) -> String {
    match segment.split_once('_') {
        Some((user, _agent)) => user.to_string(),
        None => segment.to_string(),
    }
}

/// The address a pairwise session record is stored under.
///
/// Text form is `name.device`; an identifier without a device segment
/// addresses device zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
    /// User part of the owning identifier.
    pub name: String,
    /// Device index, zero for the primary device.
    pub device_id: u16,
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn parse_plain_user() {
        let jid = parse("123456@s.whatsapp.net");
        assert_eq!(jid.user, "123456");
        assert_eq!(jid.device, None);
        assert_eq!(jid.server, Server::Pn);
    }

    #[test]
    fn parse_device_and_display_round_trip() {
        let jid = parse("123456:12@s.whatsapp.net");
        assert_eq!(jid.device, Some(12));
        assert_eq!(jid.to_string(), "123456:12@s.whatsapp.net");
    }

    #[test]
    fn explicit_zero_device_is_distinct_from_absent() {
        let explicit = parse("123:0@s.whatsapp.net");
        let absent = parse("123@s.whatsapp.net");

        assert_eq!(explicit.device, Some(0));
        assert_eq!(absent.device, None);
        assert_ne!(explicit, absent);
        assert_eq!(explicit.to_string(), "123:0@s.whatsapp.net");
        assert_eq!(absent.to_string(), "123@s.whatsapp.net");

        // Both address the same session record.
        assert_eq!(explicit.protocol_address(), absent.protocol_address());
    }

    #[test]
    fn legacy_c_us_parses_as_pn() {
        let jid = parse("123@c.us");
        assert_eq!(jid.server, Server::Pn);
        assert_eq!(jid.to_string(), "123@s.whatsapp.net");
    }

    #[test]
    fn agent_suffix_is_dropped() {
        let jid = parse("123_7:2@s.whatsapp.net");
        assert_eq!(jid.user, "123");
        assert_eq!(jid.device, Some(2));
    }

    #[test]
    fn unknown_server_is_rejected() {
        let err = "123@nowhere.example".parse::<Jid>().unwrap_err();
        assert!(matches!(err, JidError::UnknownServer { .. }));
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(matches!("no-at-sign".parse::<Jid>(), Err(JidError::Malformed { .. })));
        assert!(matches!("@lid".parse::<Jid>(), Err(JidError::Malformed { .. })));
    }

    #[test]
    fn non_numeric_device_is_rejected() {
        let err = "123:abc@lid".parse::<Jid>().unwrap_err();
        assert!(matches!(err, JidError::BadDevice { .. }));
    }

    #[test]
    fn namespace_predicates() {
        assert!(parse("1@s.whatsapp.net").is_pn_user());
        assert!(parse("1@s.whatsapp.net").is_pn_shaped());
        assert!(parse("1@hosted").is_hosted_pn());
        assert!(parse("1@hosted").is_pn_shaped());
        assert!(!parse("1@hosted").is_pn_user());

        assert!(parse("a@lid").is_lid_user());
        assert!(parse("a@lid").is_lid_shaped());
        assert!(parse("a@hosted.lid").is_hosted_lid());
        assert!(parse("a@hosted.lid").is_lid_shaped());
        assert!(!parse("a@hosted.lid").is_lid_user());

        assert!(parse("g-1@g.us").is_group());
        assert!(parse("chan@newsletter").is_newsletter());
    }

    #[test]
    fn status_broadcast_is_special_cased() {
        assert!(parse("status@broadcast").is_status_broadcast());
        assert!(parse("status@broadcast").is_broadcast());
        assert!(parse("other@broadcast").is_broadcast());
        assert!(!parse("other@broadcast").is_status_broadcast());
    }

    #[test]
    fn same_user_ignores_device_and_namespace() {
        let pn = parse("123:4@s.whatsapp.net");
        let lid = Jid::new("123", Server::Lid);
        assert!(pn.same_user(&lid));
        assert!(!pn.same_user(&Jid::new("456", Server::Pn)));
    }

    #[test]
    fn protocol_address_text_form() {
        assert_eq!(parse("123:4@lid").protocol_address().to_string(), "123.4");
        assert_eq!(parse("123@lid").protocol_address().to_string(), "123.0");
    }
}
