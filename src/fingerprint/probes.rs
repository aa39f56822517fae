//! nmap-service-probes parsing and matching
//!
//! Only `match` directives are consumed:
//!
//! ```text
//! match <ident> m<delim><regex><delim><opts> <meta>
//! ```
//!
//! The meta section carries `p/ v/ i/ h/ o/ d/` version-info fields and
//! `cpe:` tags; fields may reference capture groups with `$1`, `$2`.
//! Probes whose regex the engine cannot compile are logged and skipped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;
use tracing::{debug, info};

use crate::core::record::ServiceRecord;

use super::service::add_info;

/// A compiled banner probe
#[derive(Debug)]
pub struct ServiceProbe {
    pub regex: Regex,
    pub raw: String,
    /// Enumerated ident, e.g. `http-3`
    pub ident: String,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub info: String,
    pub hostname: String,
    pub os: String,
    pub device_type: String,
    pub case_insensitive: bool,
    pub include_newlines: bool,
}

/// All loaded probes, grouped by their base ident (the probe category)
#[derive(Debug, Default)]
pub struct ProbeSet {
    categories: HashMap<String, Vec<ServiceProbe>>,
    pub total: usize,
    pub skipped: usize,
}

/// Well-known TCP ports to probe category, used as the first guess
fn category_for_port(port: u16) -> Option<&'static str> {
    match port {
        21 => Some("ftp"),
        22 => Some("ssh"),
        25 => Some("smtp"),
        80 => Some("http"),
        110 => Some("pop3"),
        143 => Some("imap"),
        _ => None,
    }
}

impl ProbeSet {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read probe file {}", path.display()))?;

        let set = Self::parse(&content);
        info!(
            path = %path.display(),
            probes = set.total,
            skipped = set.skipped,
            "loaded service probes"
        );
        Ok(set)
    }

    /// Parse probe definitions, skipping comments, blanks and probes whose
    /// regex does not compile.
    pub fn parse(content: &str) -> Self {
        let mut set = Self::default();
        let mut enums: HashMap<String, usize> = HashMap::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(rest) = line.strip_prefix("match ") else {
                continue;
            };

            match parse_match_line(rest) {
                Some(mut probe) => {
                    let base_ident = probe.base_ident.clone();
                    let n = enums.entry(base_ident.clone()).or_insert(0);
                    *n += 1;
                    probe.enumerated = format!("{}-{}", base_ident, n);
                    let enumerated = probe.enumerated.clone();

                    match probe.compile() {
                        Some(compiled) => {
                            set.total += 1;
                            set.categories.entry(base_ident).or_default().push(compiled);
                        }
                        None => {
                            debug!(line = lineno + 1, ident = %enumerated, "unsupported probe regex, skipping");
                            set.skipped += 1;
                        }
                    }
                }
                None => {
                    debug!(line = lineno + 1, "malformed probe line, skipping");
                    set.skipped += 1;
                }
            }
        }

        set
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Match a banner against the probes in definition order and merge
    /// matched template fields into the service record.
    ///
    /// The category mapped to the service port is searched first; unless
    /// `stop_after_match`, all remaining categories are searched too.
    /// Returns true when at least one probe matched.
    pub fn match_banner(
        &self,
        service: &mut ServiceRecord,
        banner: &[u8],
        ident: &str,
        stop_after_match: bool,
    ) -> bool {
        let text = String::from_utf8_lossy(banner);
        let expected = category_for_port(service.port);
        let mut found = false;

        if let Some(category) = expected {
            if let Some(probes) = self.categories.get(category) {
                found = match_probes(service, probes, &text, ident, stop_after_match);
                if found && stop_after_match {
                    return true;
                }
            }
        }

        if !found || !stop_after_match {
            for (category, probes) in &self.categories {
                if Some(category.as_str()) == expected {
                    continue;
                }
                if match_probes(service, probes, &text, ident, stop_after_match) {
                    found = true;
                    if stop_after_match {
                        return true;
                    }
                }
            }
        }

        found
    }
}

fn match_probes(
    service: &mut ServiceRecord,
    probes: &[ServiceProbe],
    banner: &str,
    ident: &str,
    stop_after_match: bool,
) -> bool {
    let mut found = false;

    for probe in probes {
        if let Some(caps) = probe.regex.captures(banner) {
            let groups: Vec<String> = caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();

            service.product = add_info(&service.product, &extract_group(&probe.product, &groups));
            service.vendor = add_info(&service.vendor, &extract_group(&probe.vendor, &groups));
            service.hostname = add_info(&service.hostname, &extract_group(&probe.hostname, &groups));
            service.os = add_info(&service.os, &extract_group(&probe.os, &groups));
            service.version = add_info(&service.version, &extract_group(&probe.version, &groups));
            service.info = add_info(&service.info, &extract_group(&probe.info, &groups));
            service.device_type = add_info(&service.device_type, &probe.device_type);

            debug!(ident, probe = %probe.ident, "service probe matched");

            if stop_after_match {
                return true;
            }
            found = true;
        }
    }

    found
}

/// Substitute `$N` back-references in a version-info template
fn extract_group(template: &str, groups: &[String]) -> String {
    if !template.contains('$') {
        return template.to_string();
    }

    static RE_GROUP: OnceLock<Regex> = OnceLock::new();
    let re = RE_GROUP.get_or_init(|| Regex::new(r"\$[0-9]").unwrap());

    match re.find(template) {
        Some(m) => {
            let index: usize = template[m.start() + 1..m.end()].parse().unwrap_or(0);
            match groups.get(index) {
                Some(value) => template.replacen(m.as_str(), value, 1),
                None => template.to_string(),
            }
        }
        None => template.to_string(),
    }
}

/// Intermediate parse result before regex compilation
struct RawProbe {
    base_ident: String,
    enumerated: String,
    regex: String,
    product: String,
    vendor: String,
    version: String,
    info: String,
    hostname: String,
    os: String,
    device_type: String,
    case_insensitive: bool,
    include_newlines: bool,
}

impl RawProbe {
    fn compile(self) -> Option<ServiceProbe> {
        let mut flags = String::from("(?m");
        if self.case_insensitive {
            flags.push('i');
        }
        if self.include_newlines {
            flags.push('s');
        }
        flags.push(')');

        let pattern = format!("{}{}", flags, self.regex.trim());
        let regex = Regex::new(&pattern).ok()?;

        Some(ServiceProbe {
            regex,
            raw: pattern,
            ident: self.enumerated,
            product: self.product,
            vendor: self.vendor,
            version: self.version,
            info: self.info,
            hostname: self.hostname,
            os: self.os,
            device_type: self.device_type,
            case_insensitive: self.case_insensitive,
            include_newlines: self.include_newlines,
        })
    }
}

/// Parse everything after `match ` on one probe line
fn parse_match_line(rest: &str) -> Option<RawProbe> {
    // ident token
    let ident_end = rest.find(char::is_whitespace)?;
    let ident = &rest[..ident_end];

    // skip whitespace to the m<delim> introducer
    let mut idx = ident_end;
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }

    if rest.as_bytes().get(idx) != Some(&b'm') {
        return None;
    }
    idx += 1;

    let delim = *rest.as_bytes().get(idx)? as char;
    idx += 1;

    // regex body runs until the closing delimiter
    let body_start = idx;
    let close = rest[body_start..].find(delim)? + body_start;
    let regex = rest[body_start..close].to_string();
    idx = close + 1;

    // option characters until whitespace
    let mut case_insensitive = false;
    let mut include_newlines = false;
    while let Some(&c) = rest.as_bytes().get(idx) {
        if c.is_ascii_whitespace() {
            break;
        }
        match c {
            b'i' => case_insensitive = true,
            b's' => include_newlines = true,
            _ => {}
        }
        idx += 1;
    }

    let mut probe = RawProbe {
        base_ident: ident.to_string(),
        enumerated: String::new(),
        regex,
        product: String::new(),
        vendor: String::new(),
        version: String::new(),
        info: String::new(),
        hostname: String::new(),
        os: String::new(),
        device_type: String::new(),
        case_insensitive,
        include_newlines,
    };

    parse_meta(&rest[idx..], &mut probe);
    Some(probe)
}

/// Parse the version-info section: `p/.../ v/.../ i/.../ h/.../ o/.../
/// d/.../ cpe:/...` where `/` is any delimiter character.
fn parse_meta(meta: &str, probe: &mut RawProbe) {
    let bytes = meta.as_bytes();
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx].is_ascii_whitespace() {
            idx += 1;
            continue;
        }

        let field = bytes[idx];

        // cpe tags run to the next whitespace; the vendor is the third
        // colon-separated component
        if meta[idx..].starts_with("cpe:") {
            let end = meta[idx..]
                .find(char::is_whitespace)
                .map(|e| idx + e)
                .unwrap_or(meta.len());
            let tag = &meta[idx..end];
            let parts: Vec<&str> = tag.split(':').collect();
            if probe.vendor.is_empty() {
                if let Some(vendor) = parts.get(2) {
                    probe.vendor = vendor.trim_start_matches('/').to_string();
                }
            }
            idx = end;
            continue;
        }

        let Some(&delim) = bytes.get(idx + 1) else {
            break;
        };
        idx += 2;

        let value_start = idx;
        let value_end = match meta[value_start..].find(delim as char) {
            Some(e) => value_start + e,
            None => break,
        };
        let value = meta[value_start..value_end].to_string();
        idx = value_end + 1;

        match field {
            b'p' => probe.product = value,
            b'v' => probe.version = value,
            b'i' => probe.info = value,
            b'h' => probe.hostname = value,
            b'o' => probe.os = value,
            b'd' => probe.device_type = value,
            _ => {}
        }
    }
}
