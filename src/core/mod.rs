//! Core shared types
//!
//! - `Packet`: the capture abstraction the engine consumes
//! - `layers`: strongly-typed network layer structs
//! - `record`: decoded audit records and the `Sink` boundary

pub mod layers;
pub mod packet;
pub mod record;

pub use layers::{EthernetInfo, Ipv4Info, Ipv6Info, Layer3, Layer4, TcpFlags, TcpInfo, UdpInfo};
pub use packet::Packet;
pub use record::{
    CredentialRecord, FlowRecord, FlowScope, HttpRecord, Mail, MailPart, MemorySink, NullSink,
    Pop3Record, Pop3Request, Pop3Response, Record, ServiceRecord, Sink, SshRecord,
};

/// Compute an md5 hex digest, used for HASSH fingerprints
pub fn compute_md5_hex(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    format!("{:x}", digest)
}

/// Flow identifier in the form `clientIP:clientPort->serverIP:serverPort`
pub fn flow_ident(client_ip: &str, client_port: u16, server_ip: &str, server_port: u16) -> String {
    format!("{}:{}->{}:{}", client_ip, client_port, server_ip, server_port)
}

/// Swap the two sides of a flow identifier
pub fn reverse_flow_ident(ident: &str) -> String {
    match ident.split_once("->") {
        Some((a, b)) => format!("{}->{}", b, a),
        None => ident.to_string(),
    }
}
