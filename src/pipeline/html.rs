//! HTML to plain text conversion for HTML-only messages.

/// Convert an HTML body to readable plain text.
///
/// Drops tags, `<script>` and `<style>` content, turns block-level tags
/// into line breaks and decodes the common entities. Runs of blank lines
/// collapse to one.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        push_decoded(&mut text, &rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = after[..end].trim();
        rest = &after[end + 1..];

        let name = tag_name(tag);
        if !tag.starts_with('/') && matches!(name.as_str(), "script" | "style" | "head") {
            let close = format!("</{name}");
            rest = match find_ascii_ci(rest, &close) {
                Some(pos) => rest[pos..].find('>').map_or("", |gt| &rest[pos + gt + 1..]),
                None => "",
            };
            continue;
        }
        if name == "br" {
            text.push('\n');
        } else if is_paragraph(&name) {
            end_line(&mut text, 2);
        } else if is_break(&name) {
            end_line(&mut text, 1);
        }
    }
    push_decoded(&mut text, rest);

    normalize_lines(&text)
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Make the text end with at least `count` line breaks, ignoring trailing
/// spaces.
fn end_line(text: &mut String, count: usize) {
    let existing = text
        .trim_end_matches(' ')
        .chars()
        .rev()
        .take_while(|c| *c == '\n')
        .count();
    for _ in existing..count {
        text.push('\n');
    }
}

/// Opening and closing both leave a blank line.
fn is_paragraph(name: &str) -> bool {
    matches!(
        name,
        "p" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "table" | "ul" | "ol" | "blockquote" | "pre"
    )
}

fn is_break(name: &str) -> bool {
    matches!(name, "div" | "tr" | "li" | "hr" | "title")
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())
}

/// Source line breaks and tabs are plain whitespace in HTML.
fn push_source(out: &mut String, fragment: &str) {
    out.extend(
        fragment
            .chars()
            .map(|c| if matches!(c, '\r' | '\n' | '\t') { ' ' } else { c }),
    );
}

fn push_decoded(out: &mut String, fragment: &str) {
    let mut rest = fragment;
    while let Some(amp) = rest.find('&') {
        push_source(out, &rest[..amp]);
        let after = &rest[amp..];
        match after.find(';').filter(|semi| *semi <= 10) {
            Some(semi) => match decode_entity(&after[1..semi]) {
                Some(c) => {
                    out.push(c);
                    rest = &after[semi + 1..];
                }
                None => {
                    out.push('&');
                    rest = &after[1..];
                }
            },
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    push_source(out, rest);
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = entity.strip_prefix('#')?;
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

/// Collapse whitespace inside lines and drop repeated blank lines.
fn normalize_lines(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
