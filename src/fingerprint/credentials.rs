//! Credential harvesting
//!
//! Narrow regexes run against the leading bytes of a reconstructed
//! conversation. The harvester mapped to a well-known port runs first;
//! unless configured otherwise the remaining harvesters run as well.
//! Emitted records are deduplicated by service+user+password.

use std::collections::HashSet;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use regex::bytes::Regex;

use crate::core::record::CredentialRecord;

pub const SERVICE_FTP: &str = "FTP";
pub const SERVICE_TELNET: &str = "Telnet";
pub const SERVICE_HTTP_BASIC: &str = "HTTP Basic Auth";
pub const SERVICE_HTTP_DIGEST: &str = "HTTP Digest Auth";

/// A harvester searches conversation data for credentials
pub type Harvester = fn(&[u8], &str, i64) -> Option<CredentialRecord>;

/// All registered harvesters, in the order they are tried
pub fn all_harvesters() -> &'static [Harvester] {
    &[ftp_harvester, http_harvester, telnet_harvester]
}

/// First-guess harvester for a well-known port
pub fn harvester_for_port(port: u16) -> Option<Harvester> {
    match port {
        21 => Some(ftp_harvester as Harvester),
        80 => Some(http_harvester as Harvester),
        23 => Some(telnet_harvester as Harvester),
        _ => None,
    }
}

fn re_ftp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"220(?:.*?)\r\n(?:.*)\r?\n?(?:.*)\r?\n?USER\s(.*?)\r\n331(?:.*?)\r\nPASS\s(.*?)\r\n")
            .unwrap()
    })
}

fn re_http_basic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:.*?)HTTP(?:[\s\S]*)(?:Authorization: Basic )(.*?)\r\n").unwrap()
    })
}

fn re_http_digest() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:.*?)Authorization: Digest (.*?)\r\n").unwrap())
}

fn re_telnet() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:.*?)login:(?:.*?)(\w*?)\r\n(?:.*?)\r\nPassword:\s(.*?)\r\n(?:.*?)")
            .unwrap()
    })
}

fn capture_string(m: Option<regex::bytes::Match<'_>>) -> String {
    m.map(|m| String::from_utf8_lossy(m.as_bytes()).to_string())
        .unwrap_or_default()
}

/// Harvester for the FTP login sequence
pub fn ftp_harvester(data: &[u8], ident: &str, ts: i64) -> Option<CredentialRecord> {
    let caps = re_ftp().captures(data)?;

    Some(CredentialRecord {
        timestamp: ts,
        service: SERVICE_FTP.to_string(),
        flow: ident.to_string(),
        user: capture_string(caps.get(1)),
        password: capture_string(caps.get(2)),
        notes: String::new(),
    })
}

/// Harvester for HTTP Basic and Digest authorization headers
pub fn http_harvester(data: &[u8], ident: &str, ts: i64) -> Option<CredentialRecord> {
    if let Some(caps) = re_http_basic().captures(data) {
        let encoded = capture_string(caps.get(1));
        if let Ok(decoded) = BASE64.decode(encoded.as_bytes()) {
            let text = String::from_utf8_lossy(&decoded);
            let (user, password) = text.split_once(':').unwrap_or((text.as_ref(), ""));
            if !user.is_empty() {
                return Some(CredentialRecord {
                    timestamp: ts,
                    service: SERVICE_HTTP_BASIC.to_string(),
                    flow: ident.to_string(),
                    user: user.to_string(),
                    password: password.to_string(),
                    notes: String::new(),
                });
            }
        }
    }

    if let Some(caps) = re_http_digest().captures(data) {
        // the digest carries the material needed to crack the password,
        // not the password itself
        return Some(CredentialRecord {
            timestamp: ts,
            service: SERVICE_HTTP_DIGEST.to_string(),
            flow: ident.to_string(),
            user: capture_string(caps.get(1)),
            password: String::new(),
            notes: String::new(),
        });
    }

    None
}

/// Harvester for telnet login prompts.
/// Remote echo doubles every typed character of the username.
pub fn telnet_harvester(data: &[u8], ident: &str, ts: i64) -> Option<CredentialRecord> {
    let caps = re_telnet().captures(data)?;

    let echoed = capture_string(caps.get(1));
    let user: String = echoed
        .chars()
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, c)| c)
        .collect();

    Some(CredentialRecord {
        timestamp: ts,
        service: SERVICE_TELNET.to_string(),
        flow: ident.to_string(),
        user,
        password: capture_string(caps.get(2)),
        notes: String::new(),
    })
}

/// Run the harvesters over conversation data.
///
/// The harvester mapped to either port runs first; unless
/// `stop_after_match`, the remaining harvesters run afterwards.
pub fn run_harvesters(
    data: &[u8],
    src_port: u16,
    dst_port: u16,
    ident: &str,
    ts: i64,
    stop_after_match: bool,
) -> Vec<CredentialRecord> {
    let mut found = Vec::new();
    let mut tried: Option<Harvester> = None;

    for port in [dst_port, src_port] {
        if let Some(harvester) = harvester_for_port(port) {
            if tried.map(|t| t == harvester).unwrap_or(false) {
                continue;
            }
            if let Some(creds) = harvester(data, ident, ts) {
                found.push(creds);
                if stop_after_match {
                    return found;
                }
            }
            tried = Some(harvester);
        }
    }

    for harvester in all_harvesters() {
        if tried.map(|t| t == *harvester).unwrap_or(false) {
            continue;
        }
        if let Some(creds) = harvester(data, ident, ts) {
            found.push(creds);
            if stop_after_match {
                break;
            }
        }
    }

    found
}

/// Deduplication store for emitted credentials
#[derive(Debug, Default)]
pub struct CredentialStore {
    seen: Mutex<HashSet<String>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this credential has not been seen before
    pub fn insert(&self, creds: &CredentialRecord) -> bool {
        let key = format!("{}{}{}", creds.service, creds.user, creds.password);
        self.seen.lock().insert(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ftp_harvester_exact() {
        let transcript =
            b"220 ProFTPD Server ready.\r\nUSER ftpUser\r\n331 Password required\r\nPASS ftpPass\r\n";

        let creds = ftp_harvester(transcript, "flow", 42).unwrap();
        assert_eq!(creds.user, "ftpUser");
        assert_eq!(creds.password, "ftpPass");
        assert_eq!(creds.service, SERVICE_FTP);
        assert_eq!(creds.timestamp, 42);
    }

    #[test]
    fn test_ftp_no_match() {
        assert!(ftp_harvester(b"220 hello\r\nQUIT\r\n", "flow", 0).is_none());
    }

    #[test]
    fn test_http_basic_harvester() {
        // admin:secret
        let data = b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n";

        let creds = http_harvester(data, "flow", 0).unwrap();
        assert_eq!(creds.user, "admin");
        assert_eq!(creds.password, "secret");
        assert_eq!(creds.service, SERVICE_HTTP_BASIC);
    }

    #[test]
    fn test_telnet_harvester_deduplicates_echo() {
        let data = b"login: rroooott\r\nxx\r\nPassword: hunter2\r\nwelcome\r\n";

        let creds = telnet_harvester(data, "flow", 0).unwrap();
        assert_eq!(creds.user, "root");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn test_run_harvesters_port_first() {
        let transcript =
            b"220 srv\r\nUSER u\r\n331 ok\r\nPASS p\r\n";

        let found = run_harvesters(transcript, 50000, 21, "flow", 0, true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service, SERVICE_FTP);
    }

    #[test]
    fn test_credential_store_dedup() {
        let store = CredentialStore::new();
        let creds = CredentialRecord {
            service: "FTP".into(),
            user: "u".into(),
            password: "p".into(),
            ..Default::default()
        };

        assert!(store.insert(&creds));
        assert!(!store.insert(&creds));
        assert_eq!(store.len(), 1);
    }
}
