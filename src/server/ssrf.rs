//! Embed URL validation. The service fetches attacker-supplied URLs with a
//! real browser, so anything that could reach loopback or RFC1918 space is
//! rejected before it touches the pool.

use std::net::Ipv4Addr;

use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid embed url")]
    Malformed,
    #[error("embed url scheme must be http or https")]
    Scheme,
    #[error("embed url host is not allowed")]
    BlockedHost,
}

pub fn validate_embed_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|_| ValidationError::Malformed)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::Scheme);
    }
    let allowed = match url.host() {
        None => return Err(ValidationError::Malformed),
        Some(Host::Domain(domain)) => !domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(address)) => !is_private_ipv4(address),
        Some(Host::Ipv6(address)) => !address.is_loopback() && !address.is_unspecified(),
    };
    if !allowed {
        return Err(ValidationError::BlockedHost);
    }
    Ok(url)
}

fn is_private_ipv4(address: Ipv4Addr) -> bool {
    let octets = address.octets();
    match octets {
        [127, ..] | [10, ..] | [0, ..] => true,
        [172, second, ..] => (16..=31).contains(&second),
        [192, 168, ..] => true,
        [169, 254, ..] => true,
        _ => false,
    }
}
