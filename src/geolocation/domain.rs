//! Domain string normalization.

/// Normalizes a raw domain as published on-ledger or in a validator list.
///
/// Strips `http(s)://`, a trailing `/` and `.`, and any `:port`, then
/// lowercases. Returns an empty string for input that normalizes away
/// entirely; callers treat that as invalid. Idempotent.
pub fn normalize_domain(raw: &str) -> String {
    let mut domain = raw.trim();
    domain = domain.strip_prefix("http://").unwrap_or(domain);
    domain = domain.strip_prefix("https://").unwrap_or(domain);
    domain = domain.strip_suffix('/').unwrap_or(domain);
    domain = domain.strip_suffix('.').unwrap_or(domain);
    if let Some((host, port)) = domain.rsplit_once(':') {
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            domain = host;
        }
    }
    domain.trim().to_lowercase()
}

/// Decodes the hex-encoded `Domain` field of an account root and
/// normalizes the result. Empty input yields an empty string; undecodable
/// hex is an error.
pub fn decode_account_domain(domain_hex: &str) -> anyhow::Result<String> {
    if domain_hex.is_empty() {
        return Ok(String::new());
    }
    let bytes = hex::decode(domain_hex)
        .map_err(|e| anyhow::anyhow!("failed to decode account domain: {e}"))?;
    let decoded = String::from_utf8_lossy(&bytes);
    Ok(normalize_domain(decoded.trim_matches('\0')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_slash_and_dot() {
        assert_eq!(normalize_domain("https://Example.com/"), "example.com");
        assert_eq!(normalize_domain("http://example.com"), "example.com");
        assert_eq!(normalize_domain("example.com."), "example.com");
    }

    #[test]
    fn strips_port() {
        assert_eq!(normalize_domain("example.com:51234"), "example.com");
        // A non-numeric suffix after a colon is not a port.
        assert_eq!(normalize_domain("weird:name"), "weird:name");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "https://Example.com/",
            "example.com.",
            "EXAMPLE.COM:8080",
            "  ripple.com  ",
        ] {
            let once = normalize_domain(raw);
            assert_eq!(normalize_domain(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn empty_and_whitespace_normalize_to_empty() {
        assert_eq!(normalize_domain(""), "");
        assert_eq!(normalize_domain("   "), "");
        assert_eq!(normalize_domain("https:///"), "");
    }

    #[test]
    fn decodes_hex_domain() {
        let hex = hex::encode("https://Example.com/");
        assert_eq!(decode_account_domain(&hex).unwrap(), "example.com");
    }

    #[test]
    fn decode_handles_nul_padding_and_garbage() {
        let hex = hex::encode("ripple.com\0\0");
        assert_eq!(decode_account_domain(&hex).unwrap(), "ripple.com");
        assert!(decode_account_domain("zz-not-hex").is_err());
        assert_eq!(decode_account_domain("").unwrap(), "");
    }
}
