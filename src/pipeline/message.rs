//! Parsed view of a stored message plus the edits the pipeline applies.
//!
//! Stored bytes are never rewritten on disk. Edits are kept alongside the
//! original and only rendered when the message is sent.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use lettre::message::SinglePart;
use lettre::message::header::{HeaderName, HeaderValue, Headers};
use mail_parser::{MessageParser, MimeHeaders, PartType};

use crate::store::{Envelope, address_list};

/// A message as the pipeline sees it.
#[derive(Debug, Clone)]
pub struct MailMessage {
    raw: Vec<u8>,
    subject: String,
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    date: Option<DateTime<Utc>>,
    text_body: Option<String>,
    html_body: Option<String>,
    /// Boundary of a top-level `multipart/mixed` body.
    mixed_boundary: Option<String>,
    edits: Edits,
}

#[derive(Debug, Clone, Default)]
struct Edits {
    subject: Option<String>,
    headers: Vec<(&'static str, String)>,
    default_to: Option<String>,
    text_part: Option<String>,
}

impl MailMessage {
    pub fn parse(raw: Vec<u8>) -> Self {
        let parsed = MessageParser::default().parse(&raw);
        let mut message = Self {
            subject: String::new(),
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            date: None,
            text_body: None,
            html_body: None,
            mixed_boundary: None,
            edits: Edits::default(),
            raw: Vec::new(),
        };

        if let Some(parsed) = parsed {
            message.subject = parsed.subject().unwrap_or_default().to_string();
            message.from = address_list(parsed.from()).into_iter().next();
            message.to = address_list(parsed.to());
            message.cc = address_list(parsed.cc());
            message.bcc = address_list(parsed.bcc());
            message.date = parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
            // mail-parser converts HTML into the text body list when no
            // text/plain part exists; only genuine text parts count here.
            message.text_body = parsed
                .text_bodies()
                .find(|p| matches!(p.body, PartType::Text(_)))
                .and_then(|p| p.text_contents())
                .map(str::to_string);
            message.html_body = parsed
                .html_bodies()
                .find(|p| matches!(p.body, PartType::Html(_)))
                .and_then(|p| p.text_contents())
                .map(str::to_string);
            message.mixed_boundary = parsed
                .content_type()
                .filter(|ct| {
                    ct.ctype().eq_ignore_ascii_case("multipart")
                        && ct.subtype().is_some_and(|st| st.eq_ignore_ascii_case("mixed"))
                })
                .and_then(|ct| ct.attribute("boundary"))
                .map(str::to_string);
        }
        message.raw = raw;
        message
    }

    /// Current subject, edited or original. Empty when absent.
    pub fn subject(&self) -> &str {
        self.edits.subject.as_deref().unwrap_or(&self.subject)
    }

    /// Plain text body, including one synthesized from HTML.
    pub fn text_body(&self) -> Option<&str> {
        self.edits
            .text_part
            .as_deref()
            .or(self.text_body.as_deref())
    }

    pub fn html_body(&self) -> Option<&str> {
        self.html_body.as_deref()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    /// `To` header recipients, including a defaulted one.
    pub fn to(&self) -> Vec<&str> {
        self.to
            .iter()
            .map(String::as_str)
            .chain(self.edits.default_to.as_deref())
            .collect()
    }

    /// Envelope for the outbound send, taken from the headers.
    pub fn envelope(&self) -> Envelope {
        let to = self
            .to()
            .into_iter()
            .chain(self.cc.iter().map(String::as_str))
            .chain(self.bcc.iter().map(String::as_str))
            .map(str::to_string)
            .collect();
        Envelope {
            from: self.from.clone(),
            to,
            size: self.raw.len() as u64,
        }
    }

    pub fn set_subject(&mut self, subject: String) {
        self.edits.subject = Some(subject);
    }

    pub fn add_header(&mut self, name: &'static str, value: String) {
        self.edits.headers.push((name, value));
    }

    pub fn set_default_recipient(&mut self, address: String) {
        self.edits.default_to = Some(address);
    }

    pub fn attach_text_part(&mut self, text: String) {
        self.edits.text_part = Some(text);
    }

    pub fn is_edited(&self) -> bool {
        let edits = &self.edits;
        edits.subject.is_some()
            || !edits.headers.is_empty()
            || edits.default_to.is_some()
            || edits.text_part.is_some()
    }

    /// Bytes to hand to the transport. The original bytes when nothing
    /// changed; `Bcc` is always stripped.
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        if !self.is_edited() && self.bcc.is_empty() {
            return Cow::Borrowed(&self.raw);
        }
        Cow::Owned(self.render())
    }

    fn render(&self) -> Vec<u8> {
        let (head, body) = split_head(&self.raw);
        let mixed = match (&self.edits.text_part, &self.mixed_boundary) {
            (Some(_), Some(boundary)) => split_multipart(body, boundary)
                .filter(|m| m.parts.iter().any(|p| is_inline_html(p)))
                .map(|m| (boundary.as_str(), m)),
            _ => None,
        };
        let wraps_entity = self.edits.text_part.is_some() && mixed.is_none();
        let mut out = Vec::with_capacity(self.raw.len() + 1024);
        let mut entity_headers = Vec::new();
        let mut has_mime_version = false;

        for field in header_fields(head) {
            let name = field_name(field);
            has_mime_version |= name.eq_ignore_ascii_case(b"mime-version");
            if name.eq_ignore_ascii_case(b"bcc") {
                continue;
            }
            if self.edits.subject.is_some() && name.eq_ignore_ascii_case(b"subject") {
                continue;
            }
            if wraps_entity && starts_with_ignore_case(name, b"content-") {
                push_line(&mut entity_headers, field);
                continue;
            }
            push_line(&mut out, field);
        }

        let mut added = Headers::new();
        if let Some(subject) = &self.edits.subject {
            added.insert_raw(HeaderValue::new(
                HeaderName::new_from_ascii_str("Subject"),
                subject.clone(),
            ));
        }
        if let Some(to) = &self.edits.default_to
            && self.to.is_empty()
        {
            added.insert_raw(HeaderValue::new(
                HeaderName::new_from_ascii_str("To"),
                to.clone(),
            ));
        }
        for (name, value) in &self.edits.headers {
            added.insert_raw(HeaderValue::new(
                HeaderName::new_from_ascii_str(*name),
                value.clone(),
            ));
        }
        out.extend_from_slice(added.to_string().as_bytes());

        match (&self.edits.text_part, mixed) {
            (Some(text), Some((boundary, multipart))) => {
                render_mixed_with_text_part(&mut out, text, boundary, &multipart);
            }
            (Some(text), None) => {
                if !has_mime_version {
                    out.extend_from_slice(b"MIME-Version: 1.0\r\n");
                }
                let mut entity = entity_headers;
                entity.extend_from_slice(b"\r\n");
                entity.extend_from_slice(strip_line_break(body));
                push_alternative(&mut out, text, &entity);
                out.extend_from_slice(b"\r\n");
            }
            (None, _) => {
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(body);
            }
        }
        out
    }
}

/// Write a `multipart/alternative` entity of the new text part and
/// `original`, a complete entity (headers, blank line, body).
fn push_alternative(out: &mut Vec<u8>, text: &str, original: &[u8]) {
    let alternative = boundary();
    out.extend_from_slice(
        format!("Content-Type: multipart/alternative; boundary=\"{alternative}\"\r\n\r\n")
            .as_bytes(),
    );
    out.extend_from_slice(format!("--{alternative}\r\n").as_bytes());
    out.extend_from_slice(&SinglePart::plain(text.to_string()).formatted());
    out.extend_from_slice(format!("\r\n--{alternative}\r\n").as_bytes());
    out.extend_from_slice(original);
    out.extend_from_slice(format!("\r\n--{alternative}--").as_bytes());
}

/// Keep the `multipart/mixed` layout and turn its first inline HTML part
/// into an alternative with the text part. Attachments stay where they are.
fn render_mixed_with_text_part(
    out: &mut Vec<u8>,
    text: &str,
    boundary: &str,
    multipart: &Multipart<'_>,
) {
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(multipart.preamble);

    let mut replaced = false;
    for part in &multipart.parts {
        out.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        if !replaced && is_inline_html(part) {
            push_alternative(out, text, part);
            replaced = true;
        } else {
            out.extend_from_slice(part);
        }
    }
    out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    out.extend_from_slice(multipart.epilogue);
}

/// A multipart body split at its delimiter lines. Parts exclude the line
/// break that precedes each delimiter.
struct Multipart<'a> {
    preamble: &'a [u8],
    parts: Vec<&'a [u8]>,
    epilogue: &'a [u8],
}

/// `None` unless the body is properly closed with `--boundary--`.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Option<Multipart<'a>> {
    let delimiter = format!("--{boundary}");
    let mut preamble = None;
    let mut parts = Vec::new();
    let mut part_start = None;
    let mut offset = 0;

    for line in body.split_inclusive(|b| *b == b'\n') {
        let line_start = offset;
        offset += line.len();
        let Some(rest) = line.trim_ascii_end().strip_prefix(delimiter.as_bytes()) else {
            continue;
        };
        let closing = rest == b"--";
        if !closing && !rest.is_empty() {
            continue;
        }

        let end = strip_line_break(&body[..line_start]).len();
        match part_start {
            Some(start) => parts.push(&body[start..end.max(start)]),
            None => preamble = Some(&body[..end]),
        }
        if closing {
            return Some(Multipart {
                preamble: preamble?,
                parts,
                epilogue: &body[offset..],
            });
        }
        part_start = Some(offset);
    }
    None
}

/// An HTML part shown inline, not an attachment.
fn is_inline_html(part: &[u8]) -> bool {
    let (head, _) = split_head(part);
    let mut html = false;
    for field in header_fields(head) {
        let name = field_name(field);
        let value = field_value(field);
        if name.eq_ignore_ascii_case(b"content-type") {
            html = starts_with_ignore_case(value, b"text/html");
        } else if name.eq_ignore_ascii_case(b"content-disposition")
            && starts_with_ignore_case(value, b"attachment")
        {
            return false;
        }
    }
    html
}

fn strip_line_break(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}

fn boundary() -> String {
    format!("=_relay_{}", uuid::Uuid::new_v4().simple())
}

/// Split at the blank line ending the header block.
fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i + 2, i + 4));
    let lf = find(raw, b"\n\n").map(|i| (i + 1, i + 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((head_end, body_start)) => (&raw[..head_end], &raw[body_start..]),
        None => (raw, &[]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Header fields with their folded continuation lines.
fn header_fields(head: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = None;
    let mut offset = 0;
    for line in head.split_inclusive(|b| *b == b'\n') {
        let continues = matches!(line.first(), Some(b' ' | b'\t'));
        if !continues {
            if let Some(s) = start {
                fields.push(&head[s..offset]);
            }
            start = Some(offset);
        }
        offset += line.len();
    }
    if let Some(s) = start
        && s < offset
    {
        fields.push(&head[s..offset]);
    }
    fields
}

fn field_name(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|b| *b == b':').unwrap_or(field.len());
    field[..end].trim_ascii()
}

fn field_value(field: &[u8]) -> &[u8] {
    match field.iter().position(|b| *b == b':') {
        Some(colon) => field[colon + 1..].trim_ascii(),
        None => &[],
    }
}

fn starts_with_ignore_case(value: &[u8], prefix: &[u8]) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn push_line(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(field);
    if !field.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
}
