//! HTTP/1.x stream decoder
//!
//! Replays the conversation grouping consecutive same-direction chunks;
//! each group is parsed for as many complete requests or responses as the
//! buffered data permits. Framing supports Content-Length and chunked
//! transfer encoding, with transparent gzip body decompression. Pairing
//! is strictly FIFO: the oldest unmatched request is matched to the next
//! response. Unmatched messages on either side are counted and still
//! emitted as partial records.

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::core::record::{CredentialRecord, HttpRecord, Record};
use crate::stream::{decode_conversation, ByteReader, ConversationInfo, DecodeError, StreamPipeline};

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

#[derive(Debug, Default)]
struct HttpRequest {
    method: String,
    uri: String,
    proto: String,
    host: String,
    user_agent: String,
    referer: String,
    content_type: String,
    content_length: i64,
    authorization: String,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct HttpResponse {
    proto: String,
    status_code: u16,
    status_msg: String,
    content_type: String,
    content_length: i64,
    content_encoding: String,
    server: String,
    body: Vec<u8>,
}

/// Decode an HTTP conversation and emit one record per exchange.
pub fn decode(conv: &ConversationInfo, pipeline: &StreamPipeline) {
    let mut requests: Vec<HttpRequest> = Vec::new();
    let mut responses: Vec<HttpResponse> = Vec::new();

    decode_conversation(
        &conv.ident,
        &conv.data,
        |r| {
            let req = read_request(r)?;
            pipeline.stats.inc(&pipeline.stats.num_requests);
            requests.push(req);
            Ok(())
        },
        |r| {
            let res = read_response(r)?;
            pipeline.stats.inc(&pipeline.stats.num_responses);
            responses.push(res);
            Ok(())
        },
    );

    // credentials travel on requests regardless of pairing
    for req in &requests {
        for creds in harvest_request(req, conv) {
            if pipeline.fingerprint.register_credential(&creds, &pipeline.stats) {
                pipeline.write_record(&Record::Credentials(creds));
            }
        }
    }

    let mut requests = std::collections::VecDeque::from(requests);

    // FIFO pairing: every response takes the oldest unmatched request
    for res in responses {
        let record = match requests.pop_front() {
            Some(req) => combined_record(conv, Some(&req), &res),
            None => {
                pipeline.stats.inc(&pipeline.stats.num_unmatched_responses);
                combined_record(conv, None, &res)
            }
        };
        pipeline.write_record(&Record::Http(record));
    }

    // requests that never got an answer before stream end
    for req in requests {
        pipeline.stats.inc(&pipeline.stats.num_unanswered_requests);
        let record = request_only_record(conv, &req);
        pipeline.write_record(&Record::Http(record));
    }
}

fn combined_record(
    conv: &ConversationInfo,
    req: Option<&HttpRequest>,
    res: &HttpResponse,
) -> HttpRecord {
    let mut record = HttpRecord {
        timestamp: conv.first_client_packet,
        flow: conv.ident.clone(),
        client_ip: conv.client_ip.clone(),
        server_ip: conv.server_ip.clone(),
        proto: res.proto.clone(),
        status_code: res.status_code,
        status_msg: res.status_msg.clone(),
        response_content_type: res.content_type.clone(),
        response_content_length: res.content_length,
        content_encoding: res.content_encoding.clone(),
        server_name: res.server.clone(),
        response_body_len: res.body.len() as u64,
        ..Default::default()
    };

    if let Some(req) = req {
        record.method = req.method.clone();
        record.uri = req.uri.clone();
        record.host = req.host.clone();
        record.user_agent = req.user_agent.clone();
        record.referer = req.referer.clone();
        record.request_content_type = req.content_type.clone();
        record.request_content_length = req.content_length;
    } else {
        record.timestamp = conv.first_server_packet;
    }

    record
}

fn request_only_record(conv: &ConversationInfo, req: &HttpRequest) -> HttpRecord {
    HttpRecord {
        timestamp: conv.first_client_packet,
        flow: conv.ident.clone(),
        client_ip: conv.client_ip.clone(),
        server_ip: conv.server_ip.clone(),
        method: req.method.clone(),
        uri: req.uri.clone(),
        proto: req.proto.clone(),
        host: req.host.clone(),
        user_agent: req.user_agent.clone(),
        referer: req.referer.clone(),
        request_content_type: req.content_type.clone(),
        request_content_length: req.content_length,
        ..Default::default()
    }
}

/// Parse one request from the current group buffer
fn read_request(r: &mut ByteReader<'_>) -> Result<HttpRequest, DecodeError> {
    let line = r.read_line().ok_or(DecodeError::Eof)?;
    if line.is_empty() {
        return Err(DecodeError::Eof);
    }

    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::Malformed("request line is not UTF-8".into()))?;

    let mut parts = text.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();
    let proto = parts.next().unwrap_or("HTTP/1.0");

    if !VALID_METHODS.contains(&method) {
        return Err(DecodeError::Malformed(format!("invalid method {:?}", method)));
    }

    let mut req = HttpRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        proto: proto.to_string(),
        content_length: -1,
        ..Default::default()
    };

    let mut chunked = false;
    read_headers(r, |name, value| match name.as_str() {
        "host" => req.host = value,
        "user-agent" => req.user_agent = value,
        "referer" => req.referer = value,
        "content-type" => req.content_type = value,
        "content-length" => req.content_length = value.parse().unwrap_or(-1),
        "authorization" => req.authorization = value,
        "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
        _ => {}
    })?;

    req.body = read_body(r, req.content_length, chunked, false);
    Ok(req)
}

/// Parse one response from the current group buffer
fn read_response(r: &mut ByteReader<'_>) -> Result<HttpResponse, DecodeError> {
    let line = r.read_line().ok_or(DecodeError::Eof)?;
    if line.is_empty() {
        return Err(DecodeError::Eof);
    }

    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::Malformed("status line is not UTF-8".into()))?;

    if !text.starts_with("HTTP/") {
        return Err(DecodeError::Malformed("missing HTTP version".into()));
    }

    let mut parts = text.splitn(3, ' ');
    let proto = parts.next().unwrap_or_default();
    let status_code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| DecodeError::Malformed("bad status code".into()))?;
    let status_msg = parts.next().unwrap_or_default();

    let mut res = HttpResponse {
        proto: proto.to_string(),
        status_code,
        status_msg: status_msg.to_string(),
        content_length: -1,
        ..Default::default()
    };

    let mut chunked = false;
    read_headers(r, |name, value| match name.as_str() {
        "content-type" => res.content_type = value,
        "content-length" => res.content_length = value.parse().unwrap_or(-1),
        "content-encoding" => res.content_encoding = value,
        "server" => res.server = value,
        "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
        _ => {}
    })?;

    res.body = read_body(r, res.content_length, chunked, true);

    if res.content_encoding.eq_ignore_ascii_case("gzip") {
        if let Some(decoded) = gunzip(&res.body) {
            res.body = decoded;
        }
    }

    Ok(res)
}

/// Read header lines up to the empty separator line
fn read_headers<F: FnMut(String, String)>(
    r: &mut ByteReader<'_>,
    mut field: F,
) -> Result<(), DecodeError> {
    loop {
        let line = r.read_line().ok_or(DecodeError::Eof)?;
        if line.is_empty() {
            return Ok(());
        }

        let text = String::from_utf8_lossy(line);
        if let Some((name, value)) = text.split_once(':') {
            field(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
}

/// Read a message body according to its framing.
/// Responses without explicit framing are close-delimited and consume the
/// rest of the group.
fn read_body(r: &mut ByteReader<'_>, content_length: i64, chunked: bool, is_response: bool) -> Vec<u8> {
    if chunked {
        return read_chunked(r);
    }

    if content_length > 0 {
        return r.take(content_length as usize).to_vec();
    }

    if content_length < 0 && is_response {
        return r.take_rest().to_vec();
    }

    Vec::new()
}

/// Decode chunked transfer encoding
fn read_chunked(r: &mut ByteReader<'_>) -> Vec<u8> {
    let mut body = Vec::new();

    loop {
        let Some(line) = r.read_line() else {
            break;
        };

        let size_text = String::from_utf8_lossy(line);
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            break;
        };

        if size == 0 {
            // consume trailer lines through the final empty line
            while let Some(trailer) = r.read_line() {
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        body.extend_from_slice(r.take(size));
        // CRLF after the chunk payload
        r.skip_line();
    }

    body
}

fn gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Some(out),
        Err(e) => {
            debug!(error = %e, "gzip decompression failed, keeping raw body");
            None
        }
    }
}

/// Extract credentials from a request: Basic-Auth header plus login form
/// parameters in the query string and urlencoded body.
fn harvest_request(req: &HttpRequest, conv: &ConversationInfo) -> Vec<CredentialRecord> {
    let mut found = Vec::new();

    if let Some(encoded) = req.authorization.strip_prefix("Basic ") {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        if let Ok(decoded) = BASE64.decode(encoded.trim()) {
            let text = String::from_utf8_lossy(&decoded);
            if let Some((user, pass)) = text.split_once(':') {
                if !user.is_empty() || !pass.is_empty() {
                    found.push(CredentialRecord {
                        timestamp: conv.first_client_packet,
                        service: "HTTP Basic Auth".to_string(),
                        flow: conv.ident.clone(),
                        user: user.to_string(),
                        password: pass.to_string(),
                        notes: String::new(),
                    });
                }
            }
        }
    }

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some((_, query)) = req.uri.split_once('?') {
        params.extend(parse_form(query));
    }
    if req.content_type.starts_with("application/x-www-form-urlencoded") {
        params.extend(parse_form(&String::from_utf8_lossy(&req.body)));
    }

    let user = params
        .iter()
        .find(|(k, _)| k == "user" || k == "username")
        .map(|(_, v)| v.clone());
    let pass = params
        .iter()
        .find(|(k, _)| k == "pass" || k == "password")
        .map(|(_, v)| v.clone());

    if let Some(user) = user {
        found.push(CredentialRecord {
            timestamp: conv.first_client_packet,
            service: "HTTP".to_string(),
            flow: conv.ident.clone(),
            user,
            password: pass.unwrap_or_default(),
            notes: "Login Parameters".to_string(),
        });
    }

    found
}

/// Minimal urlencoded form parsing
fn parse_form(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).to_string()
}
