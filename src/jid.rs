//! Jabber Identifier (JID) value type: parsing, normalization, comparison.
//!
//! A JID is an XMPP address of the form `[localpart@]domainpart[/resourcepart]`
//! (RFC 6120 §2.1, RFC 7622). All three parts are normalized at construction:
//! localpart with the UsernameCaseMapped profile (width mapping, case folding,
//! NFC), domainpart with UTS-46 IDNA mapping, and resourcepart with the
//! OpaqueString profile (NFC, case preserved). Every downstream comparison is
//! therefore plain byte equality.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum length of a single normalized JID part (RFC 7622 §3.1).
const MAX_PART_BYTES: usize = 1023;

/// Errors produced by JID parsing and normalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The input was empty or contained no domainpart.
    #[error("address has an empty domainpart")]
    EmptyDomainpart,

    /// An `@` was present but nothing preceded it.
    #[error("address has an empty localpart before '@'")]
    EmptyLocalpart,

    /// A `/` was present but nothing followed it.
    #[error("address has an empty resourcepart after '/'")]
    EmptyResourcepart,

    /// A part contained whitespace or a control character.
    #[error("forbidden character in {0}part")]
    ForbiddenChar(&'static str),

    /// A part exceeded 1023 bytes after normalization.
    #[error("{0}part longer than {MAX_PART_BYTES} bytes after normalization")]
    PartTooLong(&'static str),

    /// The input was not valid UTF-8.
    #[error("address is not valid UTF-8")]
    InvalidUtf8,

    /// The domainpart failed IDNA mapping.
    #[error("domainpart failed IDNA mapping")]
    InvalidDomainpart,
}

/// An immutable, normalized XMPP address.
///
/// Two `Jid`s compare equal iff all three normalized parts are byte-equal,
/// so `Jid` is usable directly as a map key or routing identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Parses and normalizes a JID from its string form.
    pub fn new(s: &str) -> Result<Jid, AddressError> {
        let (local, domain, resource) = split_parts(s)?;
        Jid::from_parts(local, domain, resource)
    }

    /// Parses a JID from raw bytes, rejecting invalid UTF-8.
    ///
    /// This is the entry point for JIDs arriving as XML attribute values.
    pub fn from_bytes(b: &[u8]) -> Result<Jid, AddressError> {
        let s = std::str::from_utf8(b).map_err(|_| AddressError::InvalidUtf8)?;
        Jid::new(s)
    }

    /// Builds a JID from pre-split parts, applying the same normalization as
    /// [`Jid::new`]. Empty `local`/`resource` mean the part is absent.
    pub fn from_parts(local: &str, domain: &str, resource: &str) -> Result<Jid, AddressError> {
        Ok(Jid {
            local: normalize_localpart(local)?,
            domain: normalize_domainpart(domain)?,
            resource: normalize_resourcepart(resource)?,
        })
    }

    /// The localpart, or `""` if absent.
    pub fn localpart(&self) -> &str {
        &self.local
    }

    /// The domainpart. Never empty.
    pub fn domainpart(&self) -> &str {
        &self.domain
    }

    /// The resourcepart, or `""` if absent.
    pub fn resourcepart(&self) -> &str {
        &self.resource
    }

    /// Returns a copy of this JID with the resourcepart removed.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    /// Returns a copy of this JID keeping only the domainpart.
    pub fn domain(&self) -> Jid {
        Jid {
            local: String::new(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    /// True if the JID has no resourcepart.
    pub fn is_bare(&self) -> bool {
        self.resource.is_empty()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.local.is_empty() {
            write!(f, "{}@", self.local)?;
        }
        f.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Jid, AddressError> {
        Jid::new(s)
    }
}

/// Splits a JID string into raw (localpart, domainpart, resourcepart).
///
/// The resourcepart starts at the *first* `/` and may itself contain `/` and
/// `@`; the localpart ends at the first `@` of the bare portion.
fn split_parts(s: &str) -> Result<(&str, &str, &str), AddressError> {
    let (bare, resource) = match s.split_once('/') {
        Some((bare, resource)) => {
            if resource.is_empty() {
                return Err(AddressError::EmptyResourcepart);
            }
            (bare, resource)
        }
        None => (s, ""),
    };

    let (local, domain) = match bare.split_once('@') {
        Some((local, domain)) => {
            if local.is_empty() {
                return Err(AddressError::EmptyLocalpart);
            }
            (local, domain)
        }
        None => ("", bare),
    };

    Ok((local, domain, resource))
}

fn check_chars(part: &str, which: &'static str) -> Result<(), AddressError> {
    if part.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AddressError::ForbiddenChar(which));
    }
    Ok(())
}

fn check_len(part: &str, which: &'static str) -> Result<(), AddressError> {
    if part.len() > MAX_PART_BYTES {
        return Err(AddressError::PartTooLong(which));
    }
    Ok(())
}

/// UsernameCaseMapped (RFC 8265 §3.3): width mapping, case folding, NFC.
fn normalize_localpart(local: &str) -> Result<String, AddressError> {
    if local.is_empty() {
        return Ok(String::new());
    }
    check_chars(local, "local")?;
    let mapped: String = local.nfkc().collect();
    let folded = caseless::default_case_fold_str(&mapped);
    let normalized: String = folded.nfc().collect();
    if normalized.is_empty() {
        return Err(AddressError::EmptyLocalpart);
    }
    check_len(&normalized, "local")?;
    Ok(normalized)
}

/// UTS-46 IDNA mapping; the Unicode form is kept as the canonical domain.
fn normalize_domainpart(domain: &str) -> Result<String, AddressError> {
    if domain.is_empty() {
        return Err(AddressError::EmptyDomainpart);
    }
    check_chars(domain, "domain")?;
    let (mapped, result) = idna::domain_to_unicode(domain);
    result.map_err(|_| AddressError::InvalidDomainpart)?;
    if mapped.is_empty() {
        return Err(AddressError::EmptyDomainpart);
    }
    check_len(&mapped, "domain")?;
    Ok(mapped)
}

/// OpaqueString (RFC 8265 §4.2): NFC only, case and width preserved.
fn normalize_resourcepart(resource: &str) -> Result<String, AddressError> {
    if resource.is_empty() {
        return Ok(String::new());
    }
    check_chars(resource, "resource")?;
    let normalized: String = resource.nfc().collect();
    if normalized.is_empty() {
        return Err(AddressError::EmptyResourcepart);
    }
    check_len(&normalized, "resource")?;
    Ok(normalized)
}
