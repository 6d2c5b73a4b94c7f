//! HTTP/1.x response pipeline (C9): header construction, chunked
//! framing, gzip compression, and byte-range responses.

use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Maximum number of satisfiable sub-ranges handled per request; beyond
/// this the pipeline falls back to a full 200 response.
pub const MAX_RANGES: usize = 32;

const SERVER_NAME: &str = "sixcore";

/// Reason-phrase table; unmapped codes fall back to a fixed placeholder
/// rather than guessing a phrase (see open-question disposition).
fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown Status",
    }
}

/// HTTP version, capped at 1.1 on output regardless of what the
/// request line carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// Escapes embedded newlines in a header value by inserting a tab after
/// each one, defeating response-splitting via injected header lines.
pub fn sanitize_header_value(value: &str) -> String {
    value.replace('\n', "\n\t")
}

/// A pending response header set, accumulated before the status line
/// and headers are serialized on first write.
#[derive(Debug, Default, Clone)]
pub struct ResponseHeaders {
    pub extra: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extra.push((name.into(), sanitize_header_value(&value.into())));
    }
}

/// Describes how the response body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
}

/// Inputs needed to decide keep-alive per §4.9.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveInputs {
    pub driver_keepalive_enabled: bool,
    pub explicit_override: bool,
    pub request_version: HttpVersion,
    pub request_connection_keepalive: bool,
    pub request_body_length_known: bool,
    pub response_is_multipart_byteranges: bool,
}

pub fn decide_keep_alive(inputs: KeepAliveInputs, framing: BodyFraming) -> bool {
    if !inputs.driver_keepalive_enabled {
        return false;
    }
    if inputs.explicit_override {
        return true;
    }
    let version_implies_keepalive = match inputs.request_version {
        HttpVersion::Http11 => true,
        HttpVersion::Http10 => inputs.request_connection_keepalive,
    };
    let body_ok = inputs.request_body_length_known;
    let response_framed =
        matches!(framing, BodyFraming::Chunked) || matches!(framing, BodyFraming::ContentLength(_))
            || inputs.response_is_multipart_byteranges;
    version_implies_keepalive && body_ok && response_framed
}

/// Decides Content-Length vs chunked transfer encoding when the caller
/// did not set an explicit response length.
pub fn decide_framing(
    streaming: bool,
    request_version: HttpVersion,
    would_keep_alive: bool,
    is_multipart_byteranges: bool,
    buffered_len: u64,
) -> BodyFraming {
    if streaming
        && request_version == HttpVersion::Http11
        && would_keep_alive
        && !is_multipart_byteranges
    {
        BodyFraming::Chunked
    } else {
        BodyFraming::ContentLength(buffered_len)
    }
}

/// Builds the status line plus headers, in the mandated order:
/// status line, `Server`, `Date`, server-level extra headers,
/// driver-level extra headers, per-connection headers.
pub fn build_headers(
    version: HttpVersion,
    status: u16,
    server_extra: &[(String, String)],
    driver_extra: &[(String, String)],
    connection_headers: &ResponseHeaders,
    framing: Option<BodyFraming>,
    keep_alive: bool,
) -> String {
    let capped_version = match version {
        HttpVersion::Http10 => HttpVersion::Http10,
        HttpVersion::Http11 => HttpVersion::Http11,
    };
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} {}\r\n",
        capped_version.as_str(),
        status,
        reason_phrase(status)
    ));
    out.push_str(&format!("Server: {SERVER_NAME}\r\n"));
    out.push_str(&format!("Date: {}\r\n", http_date_now()));

    for (name, value) in server_extra.iter().chain(driver_extra.iter()).chain(connection_headers.extra.iter())
    {
        out.push_str(&format!("{name}: {}\r\n", sanitize_header_value(value)));
    }

    match framing {
        Some(BodyFraming::ContentLength(len)) => out.push_str(&format!("Content-Length: {len}\r\n")),
        Some(BodyFraming::Chunked) => out.push_str("Transfer-Encoding: chunked\r\n"),
        None => {}
    }

    out.push_str(if keep_alive { "Connection: keep-alive\r\n" } else { "Connection: close\r\n" });
    out.push_str("\r\n");
    out
}

/// Formats an RFC 7231 `Date` header value for the current time.
fn http_date_now() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    format_http_date(secs)
}

fn format_http_date(secs: u64) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"]; // epoch was a Thursday
    const MONTHS: [&str; 12] =
        ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

    let days_since_epoch = secs / 86_400;
    let time_of_day = secs % 86_400;
    let (hour, min, sec) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    let weekday = DAYS[(days_since_epoch % 7) as usize];

    let mut days = days_since_epoch as i64;
    let mut year = 1970i64;
    loop {
        let leap = is_leap_year(year);
        let year_days = if leap { 366 } else { 365 };
        if days < year_days {
            break;
        }
        days -= year_days;
        year += 1;
    }
    let month_lengths: [i64; 12] =
        if is_leap_year(year) { [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31] } else { [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31] };
    let mut month = 0usize;
    for (i, &len) in month_lengths.iter().enumerate() {
        if days < len {
            month = i;
            break;
        }
        days -= len;
    }
    let day_of_month = days + 1;

    format!(
        "{weekday}, {day_of_month:02} {} {year} {hour:02}:{min:02}:{sec:02} GMT",
        MONTHS[month]
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Incremental chunked-transfer-encoding framer.
#[derive(Default)]
pub struct ChunkedWriter;

impl ChunkedWriter {
    pub fn frame_chunk(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 16);
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn final_chunk(&self) -> &'static [u8] {
        b"0\r\n\r\n"
    }
}

/// Incremental gzip compressor used by the compression stage.
pub struct GzipStream {
    encoder: GzEncoder<Vec<u8>>,
}

impl GzipStream {
    pub fn new(level: u32) -> Self {
        GzipStream { encoder: GzEncoder::new(Vec::new(), Compression::new(level)) }
    }

    /// Compresses `data`, returning newly available compressed bytes.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        self.encoder.write_all(data)?;
        self.encoder.flush()?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    /// Finishes the gzip stream, returning any trailing bytes.
    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        self.encoder.finish()
    }
}

/// Decides whether compression applies per §4.9's gating conditions.
pub struct CompressionGate {
    pub server_gzip_enabled: bool,
    pub client_accepts_gzip: bool,
    pub min_size: usize,
    pub body_len: Option<usize>,
    pub streaming: bool,
    pub headers_sent: bool,
    pub body_suppressed: bool,
}

impl CompressionGate {
    pub fn should_compress(&self) -> bool {
        if !self.server_gzip_enabled || !self.client_accepts_gzip || self.headers_sent || self.body_suppressed {
            return false;
        }
        self.streaming || self.body_len.map(|len| len >= self.min_size).unwrap_or(false)
    }
}

/// A single satisfiable byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range: bytes=...` header value against a known total
/// length, returning up to [`MAX_RANGES`] satisfiable ranges in
/// request order. Unsatisfiable or malformed ranges are dropped; if
/// none remain, the caller should fall back to a full 200 response.
pub fn parse_byte_ranges(header_value: &str, total_len: u64) -> Vec<ByteRange> {
    let spec = match header_value.strip_prefix("bytes=") {
        Some(s) => s,
        None => return Vec::new(),
    };
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if ranges.len() >= MAX_RANGES {
            break;
        }
        let range = if let Some((start, end)) = part.split_once('-') {
            if start.is_empty() {
                // suffix range: last N bytes
                match end.parse::<u64>() {
                    Ok(n) if n > 0 && total_len > 0 => {
                        let n = n.min(total_len);
                        Some(ByteRange { start: total_len - n, end: total_len - 1 })
                    }
                    _ => None,
                }
            } else {
                let start: u64 = match start.parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if start >= total_len {
                    None
                } else if end.is_empty() {
                    Some(ByteRange { start, end: total_len - 1 })
                } else {
                    match end.parse::<u64>() {
                        Ok(e) => Some(ByteRange { start, end: e.min(total_len.saturating_sub(1)) }),
                        Err(_) => continue,
                    }
                }
            }
        } else {
            None
        };
        if let Some(r) = range {
            if r.start <= r.end {
                ranges.push(r);
            }
        }
    }
    ranges
}

/// Builds the body for a `multipart/byteranges` response, returning the
/// body bytes and the generated boundary.
pub fn build_multipart_byteranges(
    ranges: &[ByteRange],
    content_type: &str,
    total_len: u64,
    fetch: impl Fn(u64, u64) -> Vec<u8>,
) -> (Vec<u8>, String) {
    let boundary = format!("sixcore-range-{:016x}", rand::random::<u64>());
    let mut body = Vec::new();
    for range in ranges {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Range: bytes {}-{}/{total_len}\r\n\r\n", range.start, range.end).as_bytes(),
        );
        body.extend_from_slice(&fetch(range.start, range.end));
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (body, boundary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_phrase_falls_back_for_unknown_codes() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(999), "Unknown Status");
    }

    #[test]
    fn sanitize_escapes_embedded_newlines() {
        assert_eq!(sanitize_header_value("a\nb"), "a\n\tb");
    }

    #[test]
    fn keep_alive_requires_framed_response() {
        let inputs = KeepAliveInputs {
            driver_keepalive_enabled: true,
            explicit_override: false,
            request_version: HttpVersion::Http11,
            request_connection_keepalive: true,
            request_body_length_known: true,
            response_is_multipart_byteranges: false,
        };
        assert!(decide_keep_alive(inputs, BodyFraming::ContentLength(10)));
        assert!(decide_keep_alive(inputs, BodyFraming::Chunked));
    }

    #[test]
    fn keep_alive_false_when_driver_disabled() {
        let inputs = KeepAliveInputs {
            driver_keepalive_enabled: false,
            explicit_override: true,
            request_version: HttpVersion::Http11,
            request_connection_keepalive: true,
            request_body_length_known: true,
            response_is_multipart_byteranges: false,
        };
        assert!(!decide_keep_alive(inputs, BodyFraming::ContentLength(10)));
    }

    #[test]
    fn framing_prefers_chunked_when_streaming_and_http11() {
        let framing = decide_framing(true, HttpVersion::Http11, true, false, 0);
        assert_eq!(framing, BodyFraming::Chunked);
    }

    #[test]
    fn framing_falls_back_to_content_length() {
        let framing = decide_framing(false, HttpVersion::Http11, true, false, 42);
        assert_eq!(framing, BodyFraming::ContentLength(42));
    }

    #[test]
    fn chunked_writer_frames_size_and_terminator() {
        let writer = ChunkedWriter::default();
        let framed = writer.frame_chunk(b"hello");
        assert_eq!(framed, b"5\r\nhello\r\n");
        assert_eq!(writer.final_chunk(), b"0\r\n\r\n");
    }

    #[test]
    fn compression_gate_respects_min_size() {
        let gate = CompressionGate {
            server_gzip_enabled: true,
            client_accepts_gzip: true,
            min_size: 100,
            body_len: Some(10),
            streaming: false,
            headers_sent: false,
            body_suppressed: false,
        };
        assert!(!gate.should_compress());
    }

    #[test]
    fn compression_gate_allows_streaming_regardless_of_size() {
        let gate = CompressionGate {
            server_gzip_enabled: true,
            client_accepts_gzip: true,
            min_size: 100,
            body_len: None,
            streaming: true,
            headers_sent: false,
            body_suppressed: false,
        };
        assert!(gate.should_compress());
    }

    #[test]
    fn byte_range_parses_single_satisfiable_range() {
        let ranges = parse_byte_ranges("bytes=0-99", 1000);
        assert_eq!(ranges, vec![ByteRange { start: 0, end: 99 }]);
    }

    #[test]
    fn byte_range_parses_suffix_and_open_ended() {
        let ranges = parse_byte_ranges("bytes=-10", 100);
        assert_eq!(ranges, vec![ByteRange { start: 90, end: 99 }]);
        let ranges = parse_byte_ranges("bytes=90-", 100);
        assert_eq!(ranges, vec![ByteRange { start: 90, end: 99 }]);
    }

    #[test]
    fn byte_range_drops_unsatisfiable_ranges() {
        let ranges = parse_byte_ranges("bytes=500-600", 100);
        assert!(ranges.is_empty());
    }

    #[test]
    fn multipart_byteranges_includes_each_part() {
        let ranges = vec![ByteRange { start: 0, end: 1 }, ByteRange { start: 4, end: 5 }];
        let (body, boundary) =
            build_multipart_byteranges(&ranges, "text/plain", 10, |s, e| vec![b'x'; (e - s + 1) as usize]);
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(&boundary));
        assert!(text.contains("Content-Range: bytes 0-1/10"));
        assert!(text.contains("Content-Range: bytes 4-5/10"));
    }

    #[test]
    fn gzip_stream_round_trips() {
        let mut gz = GzipStream::new(6);
        let mut compressed = gz.write(b"hello world").unwrap();
        compressed.extend(gz.finish().unwrap());
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn http_date_formats_known_epoch_second() {
        assert_eq!(format_http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
