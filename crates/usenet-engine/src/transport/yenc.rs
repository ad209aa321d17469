//! Parsing of yEnc `=ybegin`/`=ypart`/`=yend` header lines.
//!
//! This module only extracts the fields needed to place a segment's bytes
//! within its file (`size`, `part`, `begin`/`end`); decoding the encoded
//! body itself is out of scope and left to an external collaborator.

use crate::error::TransportError;
use crate::transport::YencHeader;

/// Parses the `=ybegin` (and, for multi-part files, `=ypart`) line(s) that
/// precede an article's encoded body.
///
/// `lines` is the raw article text up to (not including) the first line of
/// encoded data. Returns [`TransportError::SegmentSizeUnknown`] if no
/// `begin`/`end` pair can be recovered, matching the upstream contract that
/// an unparsable header is a permanent, per-segment failure.
pub fn parse_header(lines: &str) -> Result<YencHeader, TransportError> {
    let mut part_begin: Option<u64> = None;
    let mut part_end: Option<u64> = None;
    let mut total_size: Option<u64> = None;

    for line in lines.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("=ypart ") {
            let fields = parse_fields(rest);
            part_begin = fields.get("begin").and_then(|v| v.parse().ok());
            part_end = fields.get("end").and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("=ybegin ") {
            let fields = parse_fields(rest);
            total_size = fields.get("size").and_then(|v| v.parse().ok());
            if part_begin.is_none() {
                // Single-part file: the whole size is this part's size, at offset 0.
                if let Some(size) = total_size {
                    part_begin = Some(1);
                    part_end = Some(size);
                }
            }
        }
    }

    match (part_begin, part_end) {
        (Some(begin), Some(end)) if end >= begin => Ok(YencHeader {
            // yEnc `begin`/`end` are 1-based, inclusive.
            part_size: end - begin + 1,
            part_offset: begin - 1,
        }),
        _ => Err(TransportError::SegmentSizeUnknown),
    }
}

/// Parses `key=value` pairs separated by single spaces. Only `begin`,
/// `end`, and `size` are ever read; the `name` field (the one value that
/// can itself contain spaces) is never needed here.
fn parse_fields(rest: &str) -> std::collections::HashMap<&str, &str> {
    let mut fields = std::collections::HashMap::new();
    for token in rest.split(' ') {
        if let Some((key, value)) = token.split_once('=') {
            fields.insert(key, value);
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_header() {
        let header = parse_header("=ybegin line=128 size=768000 name=file.bin\r\n").unwrap();
        assert_eq!(header.part_size, 768_000);
        assert_eq!(header.part_offset, 0);
    }

    #[test]
    fn multi_part_header() {
        let text = "=ybegin part=2 total=4 line=128 size=3072000 name=file.bin\r\n\
                     =ypart begin=768001 end=1536000\r\n";
        let header = parse_header(text).unwrap();
        assert_eq!(header.part_size, 768_000);
        assert_eq!(header.part_offset, 768_000);
    }

    #[test]
    fn missing_header_is_permanent_failure() {
        let err = parse_header("not yenc at all\r\n").unwrap_err();
        assert!(matches!(err, TransportError::SegmentSizeUnknown));
    }
}
