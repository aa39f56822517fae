//! SSH handshake decoder
//!
//! Scans the leading bytes of each direction for the version ident line
//! and the KexInit message, unmarshals the algorithm name-lists and
//! computes a HASSH fingerprint over them. Only the cleartext handshake
//! is touched; encrypted payload is never inspected.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::core::compute_md5_hex;
use crate::core::record::{Record, SshRecord};
use crate::core::reverse_flow_ident;
use crate::reassembly::Direction;
use crate::stream::{ConversationInfo, StreamPipeline};

/// Bytes per direction inspected for ident + KexInit. Enough for the
/// ident line (max 255 bytes) and a typical KexInit (~1200-1700 bytes).
const SCAN_LIMIT: usize = 2255;

/// SSH_MSG_KEXINIT message tag
const MSG_KEXINIT: u8 = 0x14;

/// Algorithm negotiation payload of SSH_MSG_KEXINIT
#[derive(Debug, Default, Clone)]
pub struct KexInitMsg {
    pub kex_algos: Vec<String>,
    pub server_host_key_algos: Vec<String>,
    pub ciphers_client_server: Vec<String>,
    pub ciphers_server_client: Vec<String>,
    pub macs_client_server: Vec<String>,
    pub macs_server_client: Vec<String>,
    pub compression_client_server: Vec<String>,
    pub compression_server_client: Vec<String>,
    pub languages_client_server: Vec<String>,
    pub languages_server_client: Vec<String>,
}

/// Decode the SSH handshake on both directions of a conversation.
pub fn decode(conv: &ConversationInfo, pipeline: &StreamPipeline) {
    for dir in [Direction::ClientToServer, Direction::ServerToClient] {
        let data = conv.side(dir, SCAN_LIMIT);
        if data.is_empty() {
            continue;
        }

        let is_client = dir == Direction::ClientToServer;
        let (ident, offset) = read_ident(&data);

        if let Some(init) = search_kex_init(&data, offset) {
            let (hassh, raw) = compute_hassh(&init);
            debug!(ident = %conv.ident, is_client, hassh = %hassh, "found KexInit");

            let version = parse_ssh_ident(&ident);
            let record = SshRecord {
                timestamp: if is_client {
                    conv.first_client_packet
                } else {
                    conv.first_server_packet
                },
                flow: if is_client {
                    conv.ident.clone()
                } else {
                    reverse_flow_ident(&conv.ident)
                },
                ident,
                hassh,
                algorithms: raw,
                is_client,
                product: version.as_ref().map(|v| v.product.clone()).unwrap_or_default(),
                version: version.as_ref().map(|v| v.version.clone()).unwrap_or_default(),
                os: version.map(|v| v.os).unwrap_or_default(),
            };

            pipeline.write_record(&Record::Ssh(record));
        }
    }
}

/// Read the version ident line (`SSH-2.0-...`) terminated by CRLF.
/// Returns the trimmed ident and the offset just past the terminator.
fn read_ident(data: &[u8]) -> (String, usize) {
    let mut last = 0u8;
    for (i, &b) in data.iter().enumerate() {
        if last == 0x0d && b == 0x0a {
            let ident = String::from_utf8_lossy(&data[..i - 1]).trim().to_string();
            return (ident, i + 1);
        }
        last = b;
    }
    (String::new(), 0)
}

/// Scan for the KexInit tag and unmarshal the negotiation payload.
///
/// The tag byte must sit right after a plausible binary packet header:
/// uint32 length, byte padding, then the message byte.
fn search_kex_init(data: &[u8], offset: usize) -> Option<KexInitMsg> {
    for i in offset..data.len() {
        if data[i] != MSG_KEXINIT {
            continue;
        }

        // the 5 header bytes precede the tag
        if i < 5 {
            continue;
        }
        let header_start = i - 5;
        let length =
            u32::from_be_bytes([data[header_start], data[header_start + 1], data[header_start + 2], data[header_start + 3]])
                as usize;
        let padding = data[header_start + 4] as usize;

        if length < 2 || length > 35_000 || padding > length {
            continue;
        }

        let payload_len = length - padding - 1;
        if data.len() < i + payload_len {
            // truncated capture; take what is there
            return unmarshal_kex_init(&data[i + 1..]);
        }

        return unmarshal_kex_init(&data[i + 1..i + payload_len]);
    }

    None
}

/// Unmarshal the KexInit payload following the message tag:
/// 16-byte cookie, then ten name-lists.
fn unmarshal_kex_init(data: &[u8]) -> Option<KexInitMsg> {
    if data.len() < 16 {
        return None;
    }
    let mut offset = 16;

    let mut init = KexInitMsg::default();
    for list in [
        &mut init.kex_algos,
        &mut init.server_host_key_algos,
        &mut init.ciphers_client_server,
        &mut init.ciphers_server_client,
        &mut init.macs_client_server,
        &mut init.macs_server_client,
        &mut init.compression_client_server,
        &mut init.compression_server_client,
        &mut init.languages_client_server,
        &mut init.languages_server_client,
    ] {
        *list = read_name_list(data, &mut offset)?;
    }

    Some(init)
}

/// Read an SSH name-list: uint32 length + comma-separated names
fn read_name_list(data: &[u8], offset: &mut usize) -> Option<Vec<String>> {
    if *offset + 4 > data.len() {
        return None;
    }

    let length = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]) as usize;
    *offset += 4;

    if *offset + length > data.len() {
        return None;
    }

    let s = std::str::from_utf8(&data[*offset..*offset + length]).ok()?;
    *offset += length;

    Some(s.split(',').map(|s| s.to_string()).collect())
}

/// HASSH = md5 over `kex;enc;mac;cmp`, each list comma-joined.
/// A pure function of the negotiated algorithm lists.
pub fn compute_hassh(init: &KexInitMsg) -> (String, String) {
    let raw = format!(
        "{};{};{};{}",
        init.kex_algos.join(","),
        init.ciphers_client_server.join(","),
        init.macs_client_server.join(","),
        init.compression_client_server.join(","),
    );

    (compute_md5_hex(&raw), raw)
}

/// Software info parsed from a version ident line
#[derive(Debug, Clone)]
pub struct SshVersionInfo {
    pub ssh_version: String,
    pub product: String,
    pub version: String,
    pub os: String,
}

fn re_ident() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(SSH-[0-9]\.?[0-9]?)-([\w.-]+)_([0-9]\.[0-9]?\.?[[:alnum:]]?[[:alnum:]]?)[[:space:]]?([[:alnum:]]*)")
            .unwrap()
    })
}

/// Parse `SSH-2.0-OpenSSH_8.2p1 Ubuntu...` into product/version/os
pub fn parse_ssh_ident(ident: &str) -> Option<SshVersionInfo> {
    let caps = re_ident().captures(ident)?;

    Some(SshVersionInfo {
        ssh_version: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        product: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        version: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
        os: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::record::MemorySink;
    use crate::fingerprint::FingerprintEngine;
    use crate::stats::{ErrorMap, Stats};
    use crate::stream::StreamData;
    use std::sync::Arc;

    fn kex_payload(lists: &[&str]) -> Vec<u8> {
        // cookie
        let mut payload = vec![0u8; 16];
        for list in lists {
            payload.extend_from_slice(&(list.len() as u32).to_be_bytes());
            payload.extend_from_slice(list.as_bytes());
        }
        // first_kex_packet_follows + reserved
        payload.push(0);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload
    }

    fn kex_packet(lists: &[&str]) -> Vec<u8> {
        let payload = kex_payload(lists);
        let padding = 4u8;
        // packet_length = padding-length byte + payload (incl. msg byte) + padding
        let length = (1 + 1 + payload.len() + padding as usize) as u32;

        let mut packet = Vec::new();
        packet.extend_from_slice(&length.to_be_bytes());
        packet.push(padding);
        packet.push(MSG_KEXINIT);
        packet.extend_from_slice(&payload);
        packet.extend_from_slice(&vec![0u8; padding as usize]);
        packet
    }

    const LISTS: &[&str] = &[
        "curve25519-sha256,ecdh-sha2-nistp256", // kex
        "ssh-ed25519",                          // host key
        "chacha20-poly1305@openssh.com,aes128-ctr", // ciphers c2s
        "chacha20-poly1305@openssh.com",        // ciphers s2c
        "hmac-sha2-256",                        // macs c2s
        "hmac-sha2-256",                        // macs s2c
        "none,zlib@openssh.com",                // compression c2s
        "none",                                 // compression s2c
        "",                                     // languages c2s
        "",                                     // languages s2c
    ];

    fn client_stream() -> Vec<u8> {
        let mut data = b"SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5\r\n".to_vec();
        data.extend_from_slice(&kex_packet(LISTS));
        data
    }

    #[test]
    fn test_read_ident() {
        let (ident, offset) = read_ident(&client_stream());
        assert_eq!(ident, "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5");
        assert_eq!(offset, 41);
    }

    #[test]
    fn test_kex_init_unmarshal() {
        let data = client_stream();
        let (_, offset) = read_ident(&data);
        let init = search_kex_init(&data, offset).unwrap();

        assert_eq!(init.kex_algos, vec!["curve25519-sha256", "ecdh-sha2-nistp256"]);
        assert_eq!(init.compression_client_server, vec!["none", "zlib@openssh.com"]);
    }

    #[test]
    fn test_hassh_deterministic() {
        let data = client_stream();
        let (_, offset) = read_ident(&data);
        let init = search_kex_init(&data, offset).unwrap();

        let (h1, raw1) = compute_hassh(&init);
        let (h2, raw2) = compute_hassh(&init);
        assert_eq!(h1, h2);
        assert_eq!(raw1, raw2);
        assert_eq!(
            raw1,
            "curve25519-sha256,ecdh-sha2-nistp256;chacha20-poly1305@openssh.com,aes128-ctr;hmac-sha2-256;none,zlib@openssh.com"
        );
    }

    #[test]
    fn test_hassh_sensitive_to_algorithm_change() {
        let data = client_stream();
        let (_, offset) = read_ident(&data);
        let init = search_kex_init(&data, offset).unwrap();

        let mut changed = init.clone();
        changed.macs_client_server = vec!["hmac-sha1".to_string()];

        assert_ne!(compute_hassh(&init).0, compute_hassh(&changed).0);
    }

    #[test]
    fn test_parse_ssh_ident() {
        let info = parse_ssh_ident("SSH-2.0-OpenSSH_8.2p1 Ubuntu").unwrap();
        assert_eq!(info.ssh_version, "SSH-2.0");
        assert_eq!(info.product, "OpenSSH");
        assert_eq!(info.version, "8.2p1");
        assert_eq!(info.os, "Ubuntu");

        assert!(parse_ssh_ident("garbage").is_none());
    }

    #[test]
    fn test_decode_emits_records() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = StreamPipeline {
            config: Config::default(),
            sink: sink.clone(),
            stats: Arc::new(Stats::new()),
            errors: Arc::new(ErrorMap::new()),
            fingerprint: FingerprintEngine::disabled(),
        };

        let mut server_stream = b"SSH-2.0-OpenSSH_7.9\r\n".to_vec();
        server_stream.extend_from_slice(&kex_packet(LISTS));

        let conv = ConversationInfo {
            ident: "c:50000->s:22".into(),
            client_ip: "c".into(),
            server_ip: "s".into(),
            client_port: 50000,
            server_port: 22,
            first_client_packet: 1,
            first_server_packet: 2,
            data: vec![
                StreamData {
                    raw: client_stream(),
                    timestamp: chrono::TimeZone::timestamp_nanos(&chrono::Utc, 0),
                    dir: Direction::ClientToServer,
                },
                StreamData {
                    raw: server_stream,
                    timestamp: chrono::TimeZone::timestamp_nanos(&chrono::Utc, 1),
                    dir: Direction::ServerToClient,
                },
            ],
        };

        decode(&conv, &pipeline);

        let records: Vec<SshRecord> = sink.filter(|r| match r {
            Record::Ssh(s) => Some(s.clone()),
            _ => None,
        });
        assert_eq!(records.len(), 2);

        let client = records.iter().find(|r| r.is_client).unwrap();
        assert_eq!(client.ident, "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5");
        assert_eq!(client.product, "OpenSSH");
        assert!(!client.hassh.is_empty());

        let server = records.iter().find(|r| !r.is_client).unwrap();
        assert_eq!(server.flow, "s:22->c:50000");
    }
}
