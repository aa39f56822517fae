//! Decoded audit records and the sink boundary
//!
//! Everything the engine produces is wrapped in [`Record`] and handed to a
//! [`Sink`]. Serialization format is the sink's business, never ours.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Granularity of a flow aggregation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowScope {
    /// Link-layer flow (MAC pair)
    Link,
    /// Network-layer flow (IP pair)
    Network,
    /// Transport-layer flow (port pair)
    Transport,
    /// Full bidirectional connection (link + network + transport)
    Connection,
}

impl std::fmt::Display for FlowScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowScope::Link => write!(f, "link"),
            FlowScope::Network => write!(f, "network"),
            FlowScope::Transport => write!(f, "transport"),
            FlowScope::Connection => write!(f, "connection"),
        }
    }
}

/// Aggregated flow audit record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRecord {
    pub scope: Option<FlowScope>,
    /// First-seen capture timestamp (nanoseconds)
    pub timestamp_first: i64,
    /// Last-seen capture timestamp (nanoseconds)
    pub timestamp_last: i64,
    /// last - first, nanoseconds
    pub duration: i64,
    pub num_packets: u64,
    pub total_size: u64,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
    pub link_proto: String,
    pub network_proto: String,
    pub transport_proto: String,
}

/// One decoded HTTP request/response exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRecord {
    pub timestamp: i64,
    pub flow: String,
    pub client_ip: String,
    pub server_ip: String,
    pub method: String,
    pub uri: String,
    pub proto: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub request_content_type: String,
    pub request_content_length: i64,
    pub status_code: u16,
    pub status_msg: String,
    pub response_content_type: String,
    pub response_content_length: i64,
    pub content_encoding: String,
    pub server_name: String,
    pub response_body_len: u64,
}

/// A single POP3 client command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pop3Request {
    pub command: String,
    pub argument: String,
}

/// A single POP3 server reply line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pop3Response {
    pub command: String,
    pub message: String,
}

/// One body part of a reconstructed mail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailPart {
    pub header: Vec<(String, String)>,
    pub content: String,
}

/// A reconstructed mail retrieved over POP3
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mail {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub parts: Vec<MailPart>,
}

/// Decoded POP3 session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pop3Record {
    pub timestamp: i64,
    pub flow: String,
    pub client_ip: String,
    pub server_ip: String,
    pub user: String,
    pub pass: String,
    pub auth_token: String,
    pub commands: Vec<String>,
    pub mail_ids: Vec<String>,
}

/// SSH handshake fingerprint record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshRecord {
    pub timestamp: i64,
    pub flow: String,
    /// Version ident line, e.g. `SSH-2.0-OpenSSH_8.2p1`
    pub ident: String,
    /// HASSH md5 fingerprint
    pub hassh: String,
    /// Raw algorithm string the fingerprint was computed over
    pub algorithms: String,
    pub is_client: bool,
    pub product: String,
    pub version: String,
    pub os: String,
}

/// Passive service identification record, keyed serverIP:serverPort
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub timestamp: i64,
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub protocol: String,
    pub banner: String,
    pub bytes_server: u64,
    pub bytes_client: u64,
    /// All flow idents that contributed to this service
    pub flows: Vec<String>,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub device_type: String,
    pub info: String,
}

/// A harvested user/password combination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub timestamp: i64,
    pub service: String,
    pub flow: String,
    pub user: String,
    pub password: String,
    pub notes: String,
}

/// Every record kind the engine can emit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Record {
    Flow(FlowRecord),
    Http(HttpRecord),
    Pop3(Pop3Record),
    Mail(Mail),
    Ssh(SshRecord),
    Service(ServiceRecord),
    Credentials(CredentialRecord),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Flow(_) => "Flow",
            Record::Http(_) => "HTTP",
            Record::Pop3(_) => "POP3",
            Record::Mail(_) => "Mail",
            Record::Ssh(_) => "SSH",
            Record::Service(_) => "Service",
            Record::Credentials(_) => "Credentials",
        }
    }
}

/// Downstream record consumer
pub trait Sink: Send + Sync {
    /// Persist one record. Failures are counted by the caller, never fatal.
    fn write(&self, record: &Record) -> Result<()>;

    /// Finish writing; returns the sink name and the number of records taken.
    fn close(&self) -> (String, u64);
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn write(&self, _record: &Record) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> (String, u64) {
        ("null".to_string(), 0)
    }
}

/// Sink collecting records in memory, used by tests and tooling
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// All records of one kind, extracted with the given matcher
    pub fn filter<T, F: Fn(&Record) -> Option<T>>(&self, f: F) -> Vec<T> {
        self.records.lock().iter().filter_map(f).collect()
    }
}

impl Sink for MemorySink {
    fn write(&self, record: &Record) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn close(&self) -> (String, u64) {
        ("memory".to_string(), self.records.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.write(&Record::Credentials(CredentialRecord {
            service: "FTP".into(),
            user: "u".into(),
            password: "p".into(),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(sink.len(), 1);
        let (name, count) = sink.close();
        assert_eq!(name, "memory");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_record_kind() {
        let r = Record::Http(HttpRecord::default());
        assert_eq!(r.kind(), "HTTP");
    }
}
