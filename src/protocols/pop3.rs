//! POP3 stream decoder
//!
//! Line-oriented replay builds parallel command and reply sequences,
//! which are then run through a two-state authentication machine to
//! extract credentials and reconstruct retrieved mails. Mail bodies are
//! decomposed into MIME-like parts by boundary markers.

use tracing::debug;

use crate::core::compute_md5_hex;
use crate::core::record::{CredentialRecord, Mail, MailPart, Pop3Record, Pop3Request, Pop3Response, Record};
use crate::stream::{decode_conversation, ConversationInfo, DecodeError, StreamPipeline};

const POP3_OK: &str = "+OK";
const POP3_ERR: &str = "-ERR";
const POP3_DOT: &str = ".";
const POP3_PLUS: &str = "+";

const POP3_USER: &str = "USER";
const POP3_PASS: &str = "PASS";
const POP3_APOP: &str = "APOP";
const POP3_AUTH: &str = "AUTH";
const POP3_STAT: &str = "STAT";
const POP3_LIST: &str = "LIST";
const POP3_UIDL: &str = "UIDL";
const POP3_RETR: &str = "RETR";
const POP3_CAPA: &str = "CAPA";
const POP3_QUIT: &str = "QUIT";
const POP3_TOP: &str = "TOP";
const POP3_STLS: &str = "STLS";

/// Authentication state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    NotAuthenticated,
    Authenticated,
}

fn valid_server_command(cmd: &str) -> bool {
    matches!(
        cmd,
        POP3_DOT | POP3_PLUS | POP3_OK | POP3_ERR | POP3_TOP | POP3_USER | POP3_UIDL | POP3_STLS
    )
}

/// Split a line into command and arguments
fn get_command(line: &str) -> (String, Vec<String>) {
    let line = line.trim_matches(|c| c == '\r' || c == ' ' || c == '\n');
    let mut parts = line.split(' ');
    let cmd = parts.next().unwrap_or_default().to_string();
    (cmd, parts.map(|s| s.to_string()).collect())
}

/// Decode a POP3 conversation and emit session, mail and credential
/// records.
pub fn decode(conv: &ConversationInfo, pipeline: &StreamPipeline) {
    let mut requests: Vec<Pop3Request> = Vec::new();
    let mut responses: Vec<Pop3Response> = Vec::new();

    decode_conversation(
        &conv.ident,
        &conv.data,
        |r| {
            let line = r.read_line().ok_or(DecodeError::Eof)?;
            let text = String::from_utf8_lossy(line);
            let (cmd, args) = get_command(&text);

            let quit = cmd == POP3_QUIT;
            requests.push(Pop3Request {
                command: cmd,
                argument: args.join(" "),
            });

            if quit {
                return Err(DecodeError::Eof);
            }
            Ok(())
        },
        |r| {
            let line = r.read_line().ok_or(DecodeError::Eof)?;
            let text = String::from_utf8_lossy(line).to_string();
            let (cmd, args) = get_command(&text);

            if valid_server_command(&cmd) {
                responses.push(Pop3Response {
                    command: cmd,
                    message: args.join(" "),
                });
            } else {
                responses.push(Pop3Response {
                    command: String::new(),
                    message: if text.is_empty() { "\n".to_string() } else { text.clone() },
                });
            }

            if text == "-ERR authentication failed" || text.contains("signing off") {
                return Err(DecodeError::Eof);
            }
            Ok(())
        },
    );

    debug!(ident = %conv.ident, requests = requests.len(), responses = responses.len(), "POP3 conversation");

    let commands: Vec<String> = requests.iter().map(|r| r.command.clone()).collect();

    let mut machine = Pop3Machine {
        requests: &requests,
        responses: &responses,
        req_index: 0,
        res_index: 0,
    };
    let outcome = machine.process(conv, pipeline);

    let record = Pop3Record {
        timestamp: conv.first_client_packet,
        flow: conv.ident.clone(),
        client_ip: conv.client_ip.clone(),
        server_ip: conv.server_ip.clone(),
        user: outcome.user.clone(),
        pass: outcome.pass.clone(),
        auth_token: outcome.token,
        commands,
        mail_ids: outcome.mail_ids,
    };

    if !outcome.user.is_empty() || !outcome.pass.is_empty() {
        let creds = CredentialRecord {
            timestamp: conv.first_client_packet,
            service: "POP3".to_string(),
            flow: conv.ident.clone(),
            user: outcome.user,
            password: outcome.pass,
            notes: String::new(),
        };
        if pipeline.fingerprint.register_credential(&creds, &pipeline.stats) {
            pipeline.write_record(&Record::Credentials(creds));
        }
    }

    pipeline.write_record(&Record::Pop3(record));
}

#[derive(Debug, Default)]
struct Pop3Outcome {
    mail_ids: Vec<String>,
    user: String,
    pass: String,
    token: String,
}

/// Replays the recorded command/reply sequences through the
/// authentication state machine.
struct Pop3Machine<'a> {
    requests: &'a [Pop3Request],
    responses: &'a [Pop3Response],
    req_index: usize,
    res_index: usize,
}

impl Pop3Machine<'_> {
    /// Reply to the most recent command, if recorded
    fn reply(&self) -> Option<&Pop3Response> {
        self.responses.get(self.res_index + 1)
    }

    fn process(&mut self, conv: &ConversationInfo, pipeline: &StreamPipeline) -> Pop3Outcome {
        let mut outcome = Pop3Outcome::default();

        if self.requests.is_empty() || self.responses.is_empty() {
            return outcome;
        }

        // conversation must open with the server hello
        let hello = &self.responses[0];
        if hello.command != POP3_OK || !hello.message.starts_with("POP server ready") {
            return outcome;
        }

        let mut state = Pop3State::NotAuthenticated;
        let mut mail_buf = String::new();

        while self.req_index < self.requests.len() {
            let r = self.requests[self.req_index].clone();
            self.req_index += 1;

            match state {
                Pop3State::Authenticated => match r.command.as_str() {
                    POP3_STAT => {
                        self.res_index += 1;
                        continue;
                    }
                    POP3_LIST | POP3_UIDL | POP3_CAPA => {
                        self.skip_multiline();
                        continue;
                    }
                    POP3_RETR => {
                        let mut n = 0;
                        for reply in &self.responses[self.res_index.min(self.responses.len())..] {
                            if reply.command == POP3_DOT {
                                let mail = parse_mail(conv, &mail_buf);
                                outcome.mail_ids.push(mail.id.clone());
                                pipeline.write_record(&Record::Mail(mail));
                                mail_buf.clear();
                                self.res_index += 1;
                                break;
                            }
                            mail_buf.push_str(&reply.message);
                            mail_buf.push('\n');
                            n += 1;
                        }
                        self.res_index += n;
                        continue;
                    }
                    POP3_QUIT => return outcome,
                    _ => {
                        self.res_index += 1;
                        continue;
                    }
                },
                Pop3State::NotAuthenticated => match r.command.as_str() {
                    POP3_USER => {
                        if let Some(reply) = self.reply() {
                            if reply.command == POP3_OK {
                                outcome.user = r.argument.clone();
                            }
                        }
                        self.res_index += 1;
                        continue;
                    }
                    POP3_PASS => {
                        if let Some(reply) = self.reply() {
                            if reply.command == POP3_OK {
                                state = Pop3State::Authenticated;
                                outcome.pass = r.argument.clone();
                            }
                        }
                        self.res_index += 1;
                        continue;
                    }
                    POP3_APOP => {
                        if let Some(reply) = self.reply() {
                            if reply.command == POP3_OK {
                                state = Pop3State::Authenticated;
                                let mut parts = r.argument.split(' ');
                                if let (Some(user), Some(token)) = (parts.next(), parts.next()) {
                                    outcome.user = user.to_string();
                                    outcome.token = token.to_string();
                                }
                            }
                        }
                        self.res_index += 1;
                        continue;
                    }
                    POP3_AUTH => {
                        if let Some(reply) = self.reply() {
                            if reply.command == POP3_OK {
                                state = Pop3State::Authenticated;
                                // the mechanism response follows as the
                                // next client command
                                if let Some(next) = self.requests.get(self.req_index) {
                                    outcome.token = next.command.clone();
                                }
                            }
                        }
                        self.res_index += 1;
                        continue;
                    }
                    POP3_CAPA => {
                        self.skip_multiline();
                        continue;
                    }
                    POP3_STAT => {
                        self.res_index += 1;
                        continue;
                    }
                    POP3_QUIT => return outcome,
                    other => {
                        debug!(command = other, "unhandled POP3 command");
                        self.res_index += 1;
                    }
                },
            }
        }

        outcome
    }

    /// Advance past a multi-line reply terminated by a lone dot
    fn skip_multiline(&mut self) {
        let mut n = 0;
        for reply in &self.responses[self.res_index.min(self.responses.len())..] {
            if reply.command == POP3_DOT {
                self.res_index += 1;
                break;
            }
            n += 1;
        }
        self.res_index += n;
    }
}

/// Decompose a retrieved mail into header fields and body parts split by
/// MIME boundary markers.
fn parse_mail(conv: &ConversationInfo, raw: &str) -> Mail {
    let mut mail = Mail::default();
    let mut header: Vec<(String, String)> = Vec::new();
    let mut boundary = String::new();

    let mut lines = raw.lines();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();

            match name.to_lowercase().as_str() {
                "from" => mail.from = value.clone(),
                "to" => mail.to = value.clone(),
                "subject" => mail.subject = value.clone(),
                "content-type" => {
                    if let Some(idx) = value.find("boundary=") {
                        boundary = value[idx + "boundary=".len()..]
                            .trim_matches('"')
                            .trim_end_matches(';')
                            .to_string();
                    }
                }
                _ => {}
            }
            header.push((name, value));
        }
    }

    let body: String = lines.collect::<Vec<_>>().join("\n");

    if boundary.is_empty() {
        mail.parts = vec![MailPart {
            header: Vec::new(),
            content: body,
        }];
    } else {
        let marker = format!("--{}", boundary);
        mail.parts = body
            .split(marker.as_str())
            .map(|part| part.trim_matches(|c| c == '\n' || c == '-'))
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut part_header = Vec::new();
                let mut part_lines = part.lines();
                for line in part_lines.by_ref() {
                    if line.is_empty() {
                        break;
                    }
                    match line.split_once(':') {
                        Some((name, value)) => {
                            part_header.push((name.trim().to_string(), value.trim().to_string()));
                        }
                        None => break,
                    }
                }
                MailPart {
                    header: part_header,
                    content: part_lines.collect::<Vec<_>>().join("\n"),
                }
            })
            .collect();
    }

    mail.id = compute_md5_hex(&format!(
        "{}{}{}{}",
        conv.ident, mail.from, mail.subject, conv.first_client_packet
    ));

    mail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::record::MemorySink;
    use crate::fingerprint::FingerprintEngine;
    use crate::reassembly::Direction;
    use crate::stats::{ErrorMap, Stats};
    use crate::stream::StreamData;
    use std::sync::Arc;

    fn pipeline() -> (StreamPipeline, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let p = StreamPipeline {
            config: Config::default(),
            sink: sink.clone(),
            stats: Arc::new(Stats::new()),
            errors: Arc::new(ErrorMap::new()),
            fingerprint: FingerprintEngine::new(Default::default()).unwrap(),
        };
        (p, sink)
    }

    fn chunk(dir: Direction, raw: &[u8], ts: i64) -> StreamData {
        StreamData {
            raw: raw.to_vec(),
            timestamp: chrono::TimeZone::timestamp_nanos(&chrono::Utc, ts),
            dir,
        }
    }

    fn conv(data: Vec<StreamData>) -> ConversationInfo {
        ConversationInfo {
            ident: "c:50000->s:110".into(),
            client_ip: "c".into(),
            server_ip: "s".into(),
            client_port: 50000,
            server_port: 110,
            first_client_packet: 10,
            first_server_packet: 20,
            data,
        }
    }

    fn session_transcript() -> Vec<StreamData> {
        vec![
            chunk(Direction::ServerToClient, b"+OK POP server ready\r\n", 0),
            chunk(Direction::ClientToServer, b"USER alice\r\n", 1),
            chunk(Direction::ServerToClient, b"+OK\r\n", 2),
            chunk(Direction::ClientToServer, b"PASS wonderland\r\n", 3),
            chunk(Direction::ServerToClient, b"+OK logged in\r\n", 4),
            chunk(Direction::ClientToServer, b"RETR 1\r\n", 5),
            chunk(
                Direction::ServerToClient,
                b"+OK message follows\r\nFrom: bob@example.com\r\nTo: alice@example.com\r\nSubject: hi\r\n\r\nhello alice\r\n.\r\n",
                6,
            ),
            chunk(Direction::ClientToServer, b"QUIT\r\n", 7),
        ]
    }

    #[test]
    fn test_user_pass_extracted() {
        let (pipeline, sink) = pipeline();
        decode(&conv(session_transcript()), &pipeline);

        let records: Vec<Pop3Record> = sink.filter(|r| match r {
            Record::Pop3(p) => Some(p.clone()),
            _ => None,
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user, "alice");
        assert_eq!(records[0].pass, "wonderland");
        assert_eq!(records[0].commands, vec!["USER", "PASS", "RETR", "QUIT"]);
        assert_eq!(records[0].mail_ids.len(), 1);

        let creds: Vec<CredentialRecord> = sink.filter(|r| match r {
            Record::Credentials(c) => Some(c.clone()),
            _ => None,
        });
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].service, "POP3");
        assert_eq!(creds[0].user, "alice");
        assert_eq!(creds[0].password, "wonderland");
    }

    #[test]
    fn test_retr_reconstructs_mail() {
        let (pipeline, sink) = pipeline();
        decode(&conv(session_transcript()), &pipeline);

        let mails: Vec<Mail> = sink.filter(|r| match r {
            Record::Mail(m) => Some(m.clone()),
            _ => None,
        });
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].from, "bob@example.com");
        assert_eq!(mails[0].subject, "hi");
        assert_eq!(mails[0].parts.len(), 1);
        assert!(mails[0].parts[0].content.contains("hello alice"));
    }

    #[test]
    fn test_apop_token() {
        let (pipeline, sink) = pipeline();
        let data = vec![
            chunk(Direction::ServerToClient, b"+OK POP server ready\r\n", 0),
            chunk(
                Direction::ClientToServer,
                b"APOP mrose c4c9334bac560ecc979e58001b3e22fb\r\n",
                1,
            ),
            chunk(Direction::ServerToClient, b"+OK\r\n", 2),
            chunk(Direction::ClientToServer, b"QUIT\r\n", 3),
        ];
        decode(&conv(data), &pipeline);

        let records: Vec<Pop3Record> = sink.filter(|r| match r {
            Record::Pop3(p) => Some(p.clone()),
            _ => None,
        });
        assert_eq!(records[0].user, "mrose");
        assert_eq!(records[0].auth_token, "c4c9334bac560ecc979e58001b3e22fb");
    }

    #[test]
    fn test_wrong_hello_yields_no_auth() {
        let (pipeline, sink) = pipeline();
        let data = vec![
            chunk(Direction::ServerToClient, b"+OK dovecot\r\n", 0),
            chunk(Direction::ClientToServer, b"USER alice\r\n", 1),
            chunk(Direction::ServerToClient, b"+OK\r\n", 2),
        ];
        decode(&conv(data), &pipeline);

        let records: Vec<Pop3Record> = sink.filter(|r| match r {
            Record::Pop3(p) => Some(p.clone()),
            _ => None,
        });
        assert_eq!(records.len(), 1);
        assert!(records[0].user.is_empty());
    }

    #[test]
    fn test_mime_boundary_parts() {
        let raw = "From: a@x\nTo: b@y\nSubject: multi\nContent-Type: multipart/mixed; boundary=\"xyz\"\n\n--xyz\nContent-Type: text/plain\n\npart one\n--xyz\nContent-Type: text/html\n\n<b>part two</b>\n--xyz--\n";
        let mail = parse_mail(&conv(Vec::<StreamData>::new()), raw);

        assert_eq!(mail.subject, "multi");
        assert_eq!(mail.parts.len(), 2);
        assert!(mail.parts[0].content.contains("part one"));
        assert!(mail.parts[1].content.contains("part two"));
        assert_eq!(mail.parts[0].header[0].0, "Content-Type");
    }
}
