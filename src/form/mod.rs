//! Form/query parser (C8): URL-encoded and multipart/form-data bodies,
//! with UTF-8 validation, fallback-charset retry, and the HTML5
//! `_charset_` re-parse rule.

use std::collections::BTreeMap;

use encoding_rs::Encoding;

use crate::error::{CoreError, CoreResult};

/// One header line (`name: value`) inside a multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSet {
    pub headers: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed file part: field name, headers, and byte offset/size into
/// the *original* body buffer (file bytes are never copied).
#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub filename: Option<String>,
    pub headers: HeaderSet,
    pub offset: usize,
    pub size: usize,
}

/// Result of parsing a form body.
#[derive(Debug, Default, Clone)]
pub struct ParsedForm {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FilePart>,
}

impl ParsedForm {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.fields.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    /// Clears file-part bookkeeping, keeping the parsed field values —
    /// mirrors the original's distinct "clear" operation.
    pub fn clear_files(&mut self) {
        self.files.clear();
    }
}

/// Decodes `bytes` with `encoding`, falling back to `fallback` on
/// failure, and finally failing the whole parse if both passes produce
/// invalid UTF-8. Percent-decoding must already have been applied to
/// `bytes` by the caller; this only handles charset transcoding.
fn decode_with_fallback<'a>(
    bytes: &'a [u8],
    encoding: &'static Encoding,
    fallback: Option<&'static Encoding>,
) -> CoreResult<std::borrow::Cow<'a, str>> {
    let (decoded, _, had_errors) = encoding.decode(bytes);
    if !had_errors {
        return Ok(decoded);
    }
    if let Some(fallback) = fallback {
        let (decoded2, _, had_errors2) = fallback.decode(bytes);
        if !had_errors2 {
            return Ok(std::borrow::Cow::Owned(decoded2.into_owned()));
        }
    }
    Err(CoreError::InvalidUtf8Form)
}

/// Decodes `bytes` with `encoding`, substituting U+FFFD for any
/// malformed sequences instead of failing. Used for the probe pass that
/// hunts for a `_charset_` override, where a garbled field elsewhere in
/// the body must not prevent that field from being found.
fn decode_lossy(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (decoded, _, _) = encoding.decode(bytes);
    decoded.into_owned()
}

/// Percent-decodes raw bytes (no charset interpretation yet).
fn percent_decode_bytes(input: &str) -> Vec<u8> {
    urlencoding::decode_binary(input.as_bytes()).into_owned()
}

/// Parses `application/x-www-form-urlencoded` bodies. Splits on `&`,
/// then on the first `=` within each token; percent-decodes key and
/// value using `encoding`, retrying with `fallback` on decode failure;
/// optionally translates CRLF -> LF in values.
pub fn parse_urlencoded(
    body: &str,
    encoding: &'static Encoding,
    fallback: Option<&'static Encoding>,
    translate_crlf: bool,
) -> CoreResult<ParsedForm> {
    let mut fields = Vec::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key_bytes = percent_decode_bytes(raw_key);
        let value_bytes = percent_decode_bytes(raw_value);
        let key = decode_with_fallback(&key_bytes, encoding, fallback)?.into_owned();
        let mut value = decode_with_fallback(&value_bytes, encoding, fallback)?.into_owned();
        if translate_crlf {
            value = value.replace("\r\n", "\n");
        }
        fields.push((key, value));
    }
    Ok(ParsedForm { fields, files: Vec::new() })
}

/// Extracts the `boundary=` parameter from a `content-type` header
/// value, e.g. `multipart/form-data; boundary=----abc`.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let pos = lower.find("boundary=")?;
    let rest = &content_type[pos + "boundary=".len()..];
    let rest = rest.trim_start();
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(stripped[..end].to_string())
    } else {
        Some(rest.split(|c: char| c == ';' || c.is_whitespace()).next().unwrap_or("").to_string())
    }
}

/// Finds the next boundary delimiter at or after `from`, treating the
/// byte before a match as the effective delimiter (so a match only
/// counts once the sequence `\r\n--boundary` or `--boundary` is found).
/// Returns the byte offset of the boundary marker itself.
fn next_boundary(body: &[u8], from: usize, boundary: &str) -> Option<usize> {
    let marker = format!("--{boundary}");
    let marker = marker.as_bytes();
    let mut i = from;
    while i + marker.len() <= body.len() {
        if &body[i..i + marker.len()] == marker {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn split_headers_and_body(part: &[u8]) -> (HeaderSet, &[u8]) {
    let mut headers = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = part[pos..].iter().position(|&b| b == b'\n').map(|p| pos + p);
        let line_end = match line_end {
            Some(p) => p,
            None => {
                return (HeaderSet { headers }, &part[pos..]);
            }
        };
        let mut line = &part[pos..line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return (HeaderSet { headers }, &part[(line_end + 1).min(part.len())..]);
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
            headers.push((name, value));
        }
        pos = line_end + 1;
    }
}

/// Extracts the `name=` and optional `filename=` parameters from a
/// `content-disposition` header value, supporting quoted and unquoted
/// forms with backslash-escapes inside quotes.
fn parse_disposition_params(disposition: &str) -> (Option<String>, Option<String>) {
    fn extract(disposition: &str, param: &str) -> Option<String> {
        let lower = disposition.to_ascii_lowercase();
        let needle = format!("{param}=");
        let pos = lower.find(&needle)?;
        let rest = &disposition[pos + needle.len()..];
        let rest = rest.trim_start();
        if let Some(stripped) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = stripped.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '"' {
                    break;
                } else {
                    out.push(c);
                }
            }
            Some(out)
        } else {
            Some(rest.split(|c: char| c == ';' || c.is_whitespace()).next().unwrap_or("").to_string())
        }
    }
    (extract(disposition, "name"), extract(disposition, "filename"))
}

/// Parses a `multipart/form-data` body. `encoding`/`fallback` drive
/// value decoding for non-file parts the same way the URL-encoded path
/// does. If the parsed form contains a `_charset_` field naming a
/// different charset, the whole body is reparsed using that charset,
/// mirroring the HTML5 multipart default-charset rule.
///
/// The first pass is a lossy probe solely to recover `_charset_` — a
/// garbled field elsewhere in the body must not prevent that reparse
/// from happening. The authoritative pass (with the resolved encoding)
/// is strict and is what can actually fail with `InvalidUtf8Form`.
pub fn parse_multipart(
    body: &[u8],
    boundary: &str,
    encoding: &'static Encoding,
    fallback: Option<&'static Encoding>,
) -> CoreResult<ParsedForm> {
    let probe = parse_multipart_once(body, boundary, encoding, fallback, false)?;

    let resolved_encoding = match probe.get("_charset_") {
        Some(requested) => match Encoding::for_label(requested.as_bytes()) {
            Some(retry_encoding) if retry_encoding.name() != encoding.name() => retry_encoding,
            _ => encoding,
        },
        None => encoding,
    };

    parse_multipart_once(body, boundary, resolved_encoding, fallback, true)
}

fn parse_multipart_once(
    body: &[u8],
    boundary: &str,
    encoding: &'static Encoding,
    fallback: Option<&'static Encoding>,
    strict: bool,
) -> CoreResult<ParsedForm> {
    let marker_len = boundary.len() + 2; // "--boundary"
    let mut form = ParsedForm::default();

    let mut cursor = match next_boundary(body, 0, boundary) {
        Some(pos) => pos + marker_len,
        None => return Ok(form),
    };

    loop {
        // Skip the CRLF immediately after the boundary line, if present.
        if body.get(cursor) == Some(&b'-') && body.get(cursor + 1) == Some(&b'-') {
            break; // trailing "--" marks the terminal boundary.
        }
        if body.get(cursor) == Some(&b'\r') {
            cursor += 1;
        }
        if body.get(cursor) == Some(&b'\n') {
            cursor += 1;
        }

        let next = next_boundary(body, cursor, boundary);
        let part_end = next.unwrap_or(body.len());
        let mut part_bytes = &body[cursor..part_end];
        // Trim the trailing CRLF that precedes the next boundary.
        if part_bytes.ends_with(b"\r\n") {
            part_bytes = &part_bytes[..part_bytes.len() - 2];
        } else if part_bytes.ends_with(b"\n") {
            part_bytes = &part_bytes[..part_bytes.len() - 1];
        }

        let (headers, part_body) = split_headers_and_body(part_bytes);
        if let Some(disposition) = headers.get("content-disposition") {
            let (name, filename) = parse_disposition_params(disposition);
            if let Some(name) = name {
                if let Some(filename) = filename {
                    let offset = part_body.as_ptr() as usize - body.as_ptr() as usize;
                    form.files.push(FilePart {
                        name,
                        filename: Some(filename),
                        headers,
                        offset,
                        size: part_body.len(),
                    });
                } else {
                    let value = if strict {
                        decode_with_fallback(part_body, encoding, fallback)?.into_owned()
                    } else {
                        match decode_with_fallback(part_body, encoding, fallback) {
                            Ok(decoded) => decoded.into_owned(),
                            Err(_) => decode_lossy(part_body, encoding),
                        }
                    };
                    form.fields.push((name, value));
                }
            }
        }

        match next {
            Some(pos) => cursor = pos + marker_len,
            None => break,
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoded_round_trip_keys_and_values() {
        let form = parse_urlencoded("a=1&b=hello%20world&c", encoding_rs::UTF_8, None, false).unwrap();
        assert_eq!(form.get("a"), Some("1"));
        assert_eq!(form.get("b"), Some("hello world"));
        assert_eq!(form.get("c"), Some(""));
    }

    #[test]
    fn urlencoded_translates_crlf_when_requested() {
        let form = parse_urlencoded("a=x%0D%0Ay", encoding_rs::UTF_8, None, true).unwrap();
        assert_eq!(form.get("a"), Some("x\ny"));
    }

    #[test]
    fn extract_boundary_handles_quoted_and_unquoted() {
        assert_eq!(
            extract_boundary("multipart/form-data; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_boundary(r#"multipart/form-data; boundary="ab c""#),
            Some("ab c".to_string())
        );
    }

    fn build_multipart(boundary: &str, parts: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, value) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(f) => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\r\n").as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn multipart_parses_fields_and_files() {
        let body = build_multipart(
            "XBOUND",
            &[("name", None, "value"), ("upload", Some("f.txt"), "filedata")],
        );
        let form = parse_multipart(&body, "XBOUND", encoding_rs::UTF_8, None).unwrap();
        assert_eq!(form.get("name"), Some("value"));
        assert_eq!(form.files.len(), 1);
        assert_eq!(form.files[0].name, "upload");
        assert_eq!(form.files[0].filename.as_deref(), Some("f.txt"));
        let file_bytes = &body[form.files[0].offset..form.files[0].offset + form.files[0].size];
        assert_eq!(file_bytes, b"filedata");
    }

    #[test]
    fn charset_field_triggers_reparse() {
        // ISO-8859-1 encodes 'é' as the single byte 0xE9, which is
        // invalid UTF-8 on its own; the _charset_ field should trigger
        // a reparse that decodes it correctly.
        let mut body = Vec::new();
        body.extend_from_slice(b"--XB\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"_charset_\"\r\n\r\n");
        body.extend_from_slice(b"iso-8859-1");
        body.extend_from_slice(b"\r\n--XB\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"f\"\r\n\r\n");
        body.push(0xE9);
        body.extend_from_slice(b"\r\n--XB--\r\n");

        let form = parse_multipart(&body, "XB", encoding_rs::UTF_8, None).unwrap();
        assert_eq!(form.get("f"), Some("é"));
    }
}
