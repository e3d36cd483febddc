//! Hand-rolled `sdns://` DNS stamp decoder.
//!
//! No `dnsstamps`-equivalent crate is vendored anywhere in the reference
//! pack, so this is genuinely novel domain logic rather than ambient
//! infrastructure: a URL-safe-base64 payload whose first byte is the
//! protocol tag, followed by props (u64 LE), then length-prefixed
//! server-address, hashes, hostname, and path fields.

use thiserror::Error;

const SCHEME: &str = "sdns://";
const PROTO_DOH: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("stamp is missing the sdns:// scheme")]
    MissingScheme,
    #[error("stamp payload is not valid base64: {0}")]
    Base64(String),
    #[error("stamp payload is empty")]
    Empty,
    #[error("unsupported protocol tag {0:#x}, only DoH (0x02) is supported")]
    UnsupportedProtocol(u8),
    #[error("stamp payload is truncated")]
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohStamp {
    pub props: u64,
    /// `host:port` of the resolver, defaults to `"{provider_name}:443"` if
    /// the stamp carried no explicit server address.
    pub server_addr: String,
    pub hashes: Vec<Vec<u8>>,
    pub provider_name: String,
    pub path: String,
}

impl DohStamp {
    pub fn url(&self) -> String {
        format!("https://{}{}", self.provider_name, self.path)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn take_u64_le(&mut self) -> Result<u64, Error> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("exactly 8 bytes");
        Ok(u64::from_le_bytes(bytes))
    }

    /// length-prefixed (u8 length) byte string.
    fn take_lp(&mut self) -> Result<&'a [u8], Error> {
        let len = self.take_u8()? as usize;
        self.take(len)
    }
}

/// Parses a single `sdns://...` stamp into a [`DohStamp`]. Only the DoH
/// protocol (tag `0x02`) is supported; every other protocol tag errors.
pub fn parse_doh(stamp: &str) -> Result<DohStamp, Error> {
    let payload = stamp.strip_prefix(SCHEME).ok_or(Error::MissingScheme)?;
    if payload.is_empty() {
        return Err(Error::Empty);
    }

    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Base64(e.to_string()))?;

    let mut cursor = Cursor::new(&bytes);
    let proto = cursor.take_u8()?;
    if proto != PROTO_DOH {
        return Err(Error::UnsupportedProtocol(proto));
    }

    let props = cursor.take_u64_le()?;

    let server_addr_bytes = cursor.take_lp()?;
    let server_addr_raw = String::from_utf8_lossy(server_addr_bytes).to_string();

    let hash_count_field = cursor.take_lp()?;
    let mut hashes = Vec::new();
    if !hash_count_field.is_empty() {
        hashes.push(hash_count_field.to_vec());
        // Additional hashes are each length-prefixed and terminated by a
        // zero-length entry, mirroring the stamp spec's VLP array.
        loop {
            let next = cursor.take_lp()?;
            if next.is_empty() {
                break;
            }
            hashes.push(next.to_vec());
        }
    }

    let hostname_bytes = cursor.take_lp()?;
    let provider_name = String::from_utf8_lossy(hostname_bytes).to_string();

    let path_bytes = cursor.take_lp()?;
    let path = String::from_utf8_lossy(path_bytes).to_string();

    let server_addr = if server_addr_raw.is_empty() {
        format!("{provider_name}:443")
    } else {
        server_addr_raw
    };

    Ok(DohStamp { props, server_addr, hashes, provider_name, path })
}

/// Parses a stamps file's lines, skipping blanks and `#`-prefixed
/// documentation lines, and collecting only stamps that parse successfully
/// as DoH (other protocols are logged and dropped, matching the updater's
/// DoH-only filtering).
pub fn parse_file(content: &str) -> Vec<DohStamp> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| match parse_doh(line) {
            Ok(stamp) => Some(stamp),
            Err(e) => {
                tracing::warn!(%e, line, "dropping unparsable or non-DoH stamp");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_stamp(props: u64, server_addr: &str, hostname: &str, path: &str) -> String {
        let mut bytes = vec![PROTO_DOH];
        bytes.extend_from_slice(&props.to_le_bytes());
        bytes.push(server_addr.len() as u8);
        bytes.extend_from_slice(server_addr.as_bytes());
        bytes.push(0); // no hashes
        bytes.push(hostname.len() as u8);
        bytes.extend_from_slice(hostname.as_bytes());
        bytes.push(path.len() as u8);
        bytes.extend_from_slice(path.as_bytes());

        use base64::Engine;
        format!("sdns://{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    #[test]
    fn parses_well_formed_stamp() -> anyhow::Result<()> {
        let stamp = build_stamp(0, "185.95.218.42:443", "doh.example.net", "/dns-query");
        let parsed = parse_doh(&stamp)?;
        assert_eq!(parsed.server_addr, "185.95.218.42:443");
        assert_eq!(parsed.provider_name, "doh.example.net");
        assert_eq!(parsed.path, "/dns-query");
        assert_eq!(parsed.url(), "https://doh.example.net/dns-query");
        Ok(())
    }

    #[test]
    fn missing_server_addr_defaults_to_provider_name_443() -> anyhow::Result<()> {
        let stamp = build_stamp(0, "", "doh.example.net", "/dns-query");
        let parsed = parse_doh(&stamp)?;
        assert_eq!(parsed.server_addr, "doh.example.net:443");
        Ok(())
    }

    #[test]
    fn rejects_missing_scheme() {
        assert_eq!(parse_doh("https://example.net"), Err(Error::MissingScheme));
    }

    #[test]
    fn rejects_non_doh_protocol() {
        use base64::Engine;
        let bytes = vec![0x01u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let stamp = format!("sdns://{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes));
        assert_eq!(parse_doh(&stamp), Err(Error::UnsupportedProtocol(0x01)));
    }

    #[test]
    fn parse_file_skips_comments_and_blanks() {
        let stamp = build_stamp(0, "1.1.1.1:443", "doh.example.net", "/dns-query");
        let content = format!("# a documentation line\n\n{stamp}\n");
        let stamps = parse_file(&content);
        assert_eq!(stamps.len(), 1);
    }
}
