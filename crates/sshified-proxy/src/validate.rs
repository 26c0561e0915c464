//! Prometheus exposition format validation
//!
//! The proxy can refuse to forward upstream bodies that do not parse as
//! Prometheus metrics. Text exposition is checked with a strict line
//! validator; protobuf exposition is checked by decoding the
//! varint-delimited `MetricFamily` stream.

use prometheus::proto::MetricFamily;
use protobuf::{CodedInputStream, Message};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("response body is not valid UTF-8")]
    NotUtf8,

    #[error("line {line}: {reason}")]
    Text { line: usize, reason: &'static str },

    #[error("failed to parse as Prometheus protobuf format: {0}")]
    Protobuf(String),
}

/// Validate a response body as Prometheus exposition data, selecting the
/// text or protobuf parser from the upstream `Content-Type`.
pub fn validate_exposition(body: &[u8], content_type: &str) -> Result<(), ValidationError> {
    if is_protobuf_exposition(content_type) {
        validate_protobuf(body)
    } else {
        validate_text(body)
    }
}

fn is_protobuf_exposition(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .starts_with("application/vnd.google.protobuf")
}

fn validate_protobuf(body: &[u8]) -> Result<(), ValidationError> {
    let mut input = CodedInputStream::from_bytes(body);
    loop {
        match input.eof() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(ValidationError::Protobuf(e.to_string())),
        }
        let run = (|| -> protobuf::ProtobufResult<()> {
            let len = input.read_raw_varint64()?;
            let previous = input.push_limit(len)?;
            let mut family = MetricFamily::new();
            family.merge_from(&mut input)?;
            input.pop_limit(previous);
            Ok(())
        })();
        run.map_err(|e| ValidationError::Protobuf(e.to_string()))?;
    }
}

fn validate_text(body: &[u8]) -> Result<(), ValidationError> {
    let text = std::str::from_utf8(body).map_err(|_| ValidationError::NotUtf8)?;
    for (idx, line) in text.lines().enumerate() {
        validate_line(line).map_err(|reason| ValidationError::Text {
            line: idx + 1,
            reason,
        })?;
    }
    Ok(())
}

fn validate_line(line: &str) -> Result<(), &'static str> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Ok(());
    }
    if let Some(comment) = line.strip_prefix('#') {
        return validate_comment(comment);
    }
    validate_sample(line)
}

fn validate_comment(comment: &str) -> Result<(), &'static str> {
    let mut parts = comment.trim_start().splitn(2, char::is_whitespace);
    match parts.next() {
        Some("HELP") => {
            let rest = parts.next().ok_or("HELP without metric name")?;
            let name = rest.split_whitespace().next().ok_or("HELP without metric name")?;
            if !is_metric_name(name) {
                return Err("invalid metric name in HELP");
            }
            Ok(())
        }
        Some("TYPE") => {
            let rest = parts.next().ok_or("TYPE without metric name")?;
            let mut fields = rest.split_whitespace();
            let name = fields.next().ok_or("TYPE without metric name")?;
            if !is_metric_name(name) {
                return Err("invalid metric name in TYPE");
            }
            match fields.next() {
                Some("counter" | "gauge" | "histogram" | "summary" | "untyped") => {}
                Some(_) => return Err("invalid metric type"),
                None => return Err("TYPE without type"),
            }
            if fields.next().is_some() {
                return Err("trailing garbage after TYPE");
            }
            Ok(())
        }
        // Any other comment line is ignored by the parser.
        _ => Ok(()),
    }
}

fn validate_sample(line: &str) -> Result<(), &'static str> {
    let bytes = line.as_bytes();
    let mut pos = 0usize;

    // metric name
    let name_start = pos;
    while pos < bytes.len() && is_name_char(bytes[pos], pos == name_start) {
        pos += 1;
    }
    if pos == name_start {
        return Err("invalid metric name");
    }

    // optional label set
    if pos < bytes.len() && bytes[pos] == b'{' {
        pos += 1;
        pos = validate_labels(line, pos)?;
    }

    // value
    let rest = line[pos..].trim_start_matches([' ', '\t']);
    if rest.len() == line[pos..].len() && !rest.is_empty() {
        return Err("missing whitespace before value");
    }
    let mut fields = rest.split_whitespace();
    let value = fields.next().ok_or("missing sample value")?;
    if value.parse::<f64>().is_err() {
        return Err("invalid sample value");
    }

    // optional timestamp
    if let Some(timestamp) = fields.next() {
        if timestamp.parse::<i64>().is_err() {
            return Err("invalid timestamp");
        }
    }
    if fields.next().is_some() {
        return Err("trailing garbage after sample");
    }
    Ok(())
}

/// Validate the label pairs starting just after `{`; returns the position
/// just after the closing `}`.
fn validate_labels(line: &str, mut pos: usize) -> Result<usize, &'static str> {
    let bytes = line.as_bytes();
    loop {
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b'}' {
            return Ok(pos + 1);
        }

        // label name (no colon allowed, unlike metric names)
        let start = pos;
        while pos < bytes.len() && is_label_char(bytes[pos], pos == start) {
            pos += 1;
        }
        if pos == start {
            return Err("invalid label name");
        }

        if pos >= bytes.len() || bytes[pos] != b'=' {
            return Err("expected '=' after label name");
        }
        pos += 1;

        if pos >= bytes.len() || bytes[pos] != b'"' {
            return Err("expected quoted label value");
        }
        pos += 1;
        loop {
            match bytes.get(pos) {
                None => return Err("unterminated label value"),
                Some(b'"') => {
                    pos += 1;
                    break;
                }
                Some(b'\\') => match bytes.get(pos + 1) {
                    Some(b'\\' | b'"' | b'n') => pos += 2,
                    _ => return Err("invalid escape in label value"),
                },
                Some(_) => pos += 1,
            }
        }

        match bytes.get(pos) {
            Some(b',') => pos += 1,
            Some(b'}') => return Ok(pos + 1),
            _ => return Err("expected ',' or '}' after label value"),
        }
    }
}

fn is_metric_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| is_name_char(b, i == 0))
}

fn is_name_char(b: u8, first: bool) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || (!first && b.is_ascii_digit())
}

fn is_label_char(b: u8, first: bool) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || (!first && b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

    #[test]
    fn accepts_a_realistic_scrape() {
        let body = b"\
# HELP node_cpu_seconds_total Seconds the CPUs spent in each mode.\n\
# TYPE node_cpu_seconds_total counter\n\
node_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 1.0858638e+06\n\
node_cpu_seconds_total{cpu=\"0\",mode=\"user\"} 5973.72 1712200000000\n\
# TYPE up gauge\n\
up 1\n\
go_gc_duration_seconds{quantile=\"0.5\"} 3.8565e-05\n\
process_start_time_seconds 1.71e+09\n\
some_nan_metric NaN\n\
some_inf_metric{sign=\"minus\"} -Inf\n";
        assert!(validate_exposition(body, TEXT_CONTENT_TYPE).is_ok());
    }

    #[test]
    fn accepts_escapes_and_trailing_comma() {
        let body = b"m{l=\"a\\\"b\\\\c\\nd\",} 1\n";
        assert!(validate_exposition(body, TEXT_CONTENT_TYPE).is_ok());
    }

    #[test]
    fn accepts_empty_label_set_and_comments() {
        let body = b"# just a comment\nmetric{} 42\n\n";
        assert!(validate_exposition(body, TEXT_CONTENT_TYPE).is_ok());
    }

    #[test]
    fn rejects_html() {
        let body = b"<html><body>not metrics</body></html>\n";
        assert!(validate_exposition(body, TEXT_CONTENT_TYPE).is_err());
    }

    #[test]
    fn rejects_missing_value() {
        assert!(validate_exposition(b"metric_without_value\n", TEXT_CONTENT_TYPE).is_err());
    }

    #[test]
    fn rejects_bad_value_and_timestamp() {
        assert!(validate_exposition(b"metric one\n", TEXT_CONTENT_TYPE).is_err());
        assert!(validate_exposition(b"metric 1 soon\n", TEXT_CONTENT_TYPE).is_err());
    }

    #[test]
    fn rejects_unterminated_label_value() {
        assert!(validate_exposition(b"metric{l=\"open} 1\n", TEXT_CONTENT_TYPE).is_err());
    }

    #[test]
    fn rejects_bad_type_keyword() {
        assert!(validate_exposition(b"# TYPE metric flavor\n", TEXT_CONTENT_TYPE).is_err());
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(matches!(
            validate_exposition(&[0xff, 0xfe], TEXT_CONTENT_TYPE),
            Err(ValidationError::NotUtf8)
        ));
    }

    #[test]
    fn protobuf_roundtrip_validates() {
        use prometheus::proto::{Counter, Metric, MetricFamily, MetricType};

        let mut family = MetricFamily::new();
        family.set_name("requests_total".to_string());
        family.set_field_type(MetricType::COUNTER);
        let mut metric = Metric::new();
        let mut counter = Counter::new();
        counter.set_value(7.0);
        metric.set_counter(counter);
        family.mut_metric().push(metric);

        let mut body = Vec::new();
        family
            .write_length_delimited_to_writer(&mut body)
            .unwrap();

        let content_type = "application/vnd.google.protobuf; \
            proto=io.prometheus.client.MetricFamily; encoding=delimited";
        assert!(validate_exposition(&body, content_type).is_ok());

        // Truncated protobuf must fail.
        let truncated = &body[..body.len() - 1];
        assert!(validate_exposition(truncated, content_type).is_err());
    }

    #[test]
    fn empty_body_is_valid() {
        assert!(validate_exposition(b"", TEXT_CONTENT_TYPE).is_ok());
    }
}
