//! `xmpp:` URI parsing (RFC 5122).
//!
//! Grammar handled here: `xmpp:[//authority/]to[?action[;key=value(;…)]]`.
//! The authority names the account to authenticate as, the path names the
//! target, and the query selects an action with its parameters.

use std::collections::HashMap;

use thiserror::Error;

use crate::jid::{AddressError, Jid};

/// Errors produced by `xmpp:` URI parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    /// The input did not start with the `xmpp:` scheme.
    #[error("not an xmpp: URI")]
    MissingScheme,

    /// The URI carries no target address.
    #[error("xmpp: URI has no target address")]
    MissingAddress,

    /// The query named an action this parser does not recognize.
    #[error("unknown or unsupported URI action {0:?}")]
    UnknownAction(String),

    /// A percent escape was malformed or decoded to invalid UTF-8.
    #[error("malformed percent escape in URI")]
    BadEscape,

    /// An address inside the URI failed JID parsing.
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Recognized URI actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// No query: address the target directly.
    #[default]
    None,
    /// The target is a multi-user chat room to join.
    Join,
    /// Send a message; parameters may include `body`, `subject`, `thread`,
    /// `id`, `type` and `from`.
    Message,
}

/// A parsed `xmpp:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// The target address (the URI path).
    pub to_addr: Jid,
    /// The account named by the URI authority, if any.
    pub auth_addr: Option<Jid>,
    /// The action selected by the query.
    pub action: Action,
    params: HashMap<String, String>,
}

impl Uri {
    /// Parses an `xmpp:` URI.
    pub fn parse(input: &str) -> Result<Uri, UriError> {
        let rest = input
            .get(..5)
            .filter(|scheme| scheme.eq_ignore_ascii_case("xmpp:"))
            .map(|_| &input[5..])
            .ok_or(UriError::MissingScheme)?;

        let (auth_addr, rest) = if let Some(after) = rest.strip_prefix("//") {
            let (authority, path) = after
                .split_once('/')
                .ok_or(UriError::MissingAddress)?;
            let auth = Jid::new(&percent_decode(authority)?)?;
            (Some(auth), path)
        } else {
            (None, rest)
        };

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(UriError::MissingAddress);
        }
        let to_addr = Jid::new(&percent_decode(path)?)?;

        let mut action = Action::None;
        let mut params = HashMap::new();
        if let Some(query) = query {
            let mut parts = query.split(';');
            let name = parts.next().unwrap_or_default();
            action = match name {
                "" => Action::None,
                "join" => Action::Join,
                "message" => Action::Message,
                other => return Err(UriError::UnknownAction(other.to_string())),
            };
            for pair in parts {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                params.insert(percent_decode(key)?, percent_decode(value)?);
            }
        }

        Ok(Uri {
            to_addr,
            auth_addr,
            action,
            params,
        })
    }

    /// Looks up a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parses the `from` parameter of a message action as a JID.
    pub fn from_param(&self) -> Result<Option<Jid>, AddressError> {
        self.param("from").map(Jid::new).transpose()
    }
}

fn percent_decode(input: &str) -> Result<String, UriError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or(UriError::BadEscape)?;
            let hex = std::str::from_utf8(hex).map_err(|_| UriError::BadEscape)?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| UriError::BadEscape)?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| UriError::BadEscape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_address() {
        let uri = Uri::parse("xmpp:romeo@montague.net").unwrap();
        assert_eq!(uri.to_addr, Jid::new("romeo@montague.net").unwrap());
        assert_eq!(uri.auth_addr, None);
        assert_eq!(uri.action, Action::None);
        assert_eq!(uri.param("body"), None);
    }

    #[test]
    fn test_parse_join_action() {
        let uri = Uri::parse("xmpp:darkcave@macbeth.shakespeare.lit?join").unwrap();
        assert_eq!(uri.action, Action::Join);
        assert_eq!(
            uri.to_addr,
            Jid::new("darkcave@macbeth.shakespeare.lit").unwrap()
        );
    }

    #[test]
    fn test_parse_message_with_params() {
        let uri = Uri::parse(
            "xmpp:romeo@montague.net?message;subject=Test%20Message;body=Here%27s%20a%20test%20message;thread=t1;type=chat",
        )
        .unwrap();
        assert_eq!(uri.action, Action::Message);
        assert_eq!(uri.param("subject"), Some("Test Message"));
        assert_eq!(uri.param("body"), Some("Here's a test message"));
        assert_eq!(uri.param("thread"), Some("t1"));
        assert_eq!(uri.param("type"), Some("chat"));
        assert_eq!(uri.param("id"), None);
    }

    #[test]
    fn test_parse_authority() {
        let uri = Uri::parse("xmpp://guest@example.com/support@example.com?message").unwrap();
        assert_eq!(uri.auth_addr, Some(Jid::new("guest@example.com").unwrap()));
        assert_eq!(uri.to_addr, Jid::new("support@example.com").unwrap());
        assert_eq!(uri.action, Action::Message);
    }

    #[test]
    fn test_unknown_action_is_an_error() {
        assert_eq!(
            Uri::parse("xmpp:romeo@montague.net?subscribe"),
            Err(UriError::UnknownAction("subscribe".to_string()))
        );
    }

    #[test]
    fn test_missing_scheme_rejected() {
        assert_eq!(
            Uri::parse("mailto:romeo@montague.net"),
            Err(UriError::MissingScheme)
        );
        assert_eq!(Uri::parse("romeo@montague.net"), Err(UriError::MissingScheme));
    }

    #[test]
    fn test_missing_address_rejected() {
        assert_eq!(Uri::parse("xmpp:"), Err(UriError::MissingAddress));
        assert_eq!(Uri::parse("xmpp:?join"), Err(UriError::MissingAddress));
        assert_eq!(
            Uri::parse("xmpp://auth@example.com"),
            Err(UriError::MissingAddress)
        );
    }

    #[test]
    fn test_percent_decoded_address() {
        // U+2126 OHM SIGN, percent-encoded; normalizes to small omega.
        let uri = Uri::parse("xmpp:%E2%84%A6@example.com").unwrap();
        assert_eq!(uri.to_addr.localpart(), "\u{03C9}");
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert_eq!(
            Uri::parse("xmpp:romeo@montague.net?message;body=%zz"),
            Err(UriError::BadEscape)
        );
        assert_eq!(Uri::parse("xmpp:romeo%4"), Err(UriError::BadEscape));
    }

    #[test]
    fn test_from_param_parses_jid() {
        let uri =
            Uri::parse("xmpp:romeo@montague.net?message;from=juliet%40capulet.com").unwrap();
        assert_eq!(
            uri.from_param().unwrap(),
            Some(Jid::new("juliet@capulet.com").unwrap())
        );
    }
}
