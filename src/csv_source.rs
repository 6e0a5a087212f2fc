//! CSV reading against a derived schema.
//!
//! The whole file is validated before the first row is handed to the
//! importer: a record with the wrong number of columns or an encoding
//! error aborts the job without touching the store.

use csv::{ReaderBuilder, Trim};

use crate::error::{ImportError, Result};
use crate::templates::Separator;

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line in the source file.
    pub line: u64,
    pub cells: Vec<String>,
}

/// Collapse every run of blanks outside quotes into one tab.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(b) => (b.strip_suffix('\r').unwrap_or(b), "\n"),
            None => (line, ""),
        };
        let mut in_quotes = false;
        let mut pending_gap = false;
        for c in body.trim().chars() {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            if !in_quotes && (c == ' ' || c == '\t') {
                pending_gap = true;
                continue;
            }
            if pending_gap {
                out.push('\t');
                pending_gap = false;
            }
            out.push(c);
        }
        out.push_str(newline);
    }
    out
}

fn decode(bytes: &[u8]) -> Result<&str> {
    let bytes = bytes.strip_prefix(BOM).unwrap_or(bytes);
    std::str::from_utf8(bytes).map_err(|e| {
        let line = bytes[..e.valid_up_to()]
            .iter()
            .filter(|b| **b == b'\n')
            .count() as u64
            + 1;
        ImportError::FatalParse {
            line,
            message: "file is not valid UTF-8".to_string(),
        }
    })
}

/// Parse `bytes` into records of exactly `expected_columns` cells.
pub fn read_records(
    bytes: &[u8],
    separator: Separator,
    has_header_row: bool,
    expected_columns: usize,
) -> Result<Vec<RawRecord>> {
    let text = decode(bytes)?;
    let collapsed;
    let (text, delimiter) = match separator {
        Separator::Comma => (text, b','),
        Separator::Semicolon => (text, b';'),
        Separator::Tab => (text, b'\t'),
        Separator::Whitespace => {
            collapsed = collapse_whitespace(text);
            (collapsed.as_str(), b'\t')
        }
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(b'"')
        .has_headers(false)
        .flexible(true)
        .trim(Trim::None)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(|e| ImportError::FatalParse {
            line: e.position().map(|p| p.line()).unwrap_or(0),
            message: e.to_string(),
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 1);
        if i == 0 && has_header_row {
            continue;
        }
        if record.len() != expected_columns {
            return Err(ImportError::FatalParse {
                line,
                message: format!(
                    "expected {} columns, found {}",
                    expected_columns,
                    record.len()
                ),
            });
        }
        records.push(RawRecord {
            line,
            cells: record.iter().map(str::to_string).collect(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bom_and_quotes() {
        let data = b"\xEF\xBB\xBFref;name\n1;\"Doe; Jane\"\n2;Roe\n";
        let recs = read_records(data, Separator::Semicolon, true, 2).expect("read");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].cells, vec!["1", "Doe; Jane"]);
        assert_eq!(recs[0].line, 2);
        assert_eq!(recs[1].line, 3);
    }

    #[test]
    fn no_header_keeps_first_record() {
        let recs = read_records(b"a,b\nc,d\n", Separator::Comma, false, 2).expect("read");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].cells, vec!["a", "b"]);
    }

    #[test]
    fn whitespace_separator_collapses_runs() {
        let data = b"ref   last  first\n1  Doe \"Jane  Mary\"\r\n2\tRoe\t\tRick\n";
        let recs = read_records(data, Separator::Whitespace, true, 3).expect("read");
        assert_eq!(recs[0].cells, vec!["1", "Doe", "Jane  Mary"]);
        assert_eq!(recs[1].cells, vec!["2", "Roe", "Rick"]);
    }

    #[test]
    fn tab_separator_keeps_empty_cells() {
        let recs = read_records(b"1\t\tx\n", Separator::Tab, false, 3).expect("read");
        assert_eq!(recs[0].cells, vec!["1", "", "x"]);
    }

    #[test]
    fn wrong_column_count_is_fatal() {
        let err = read_records(b"h1,h2\n1,2\n3\n", Separator::Comma, true, 2).unwrap_err();
        match err {
            ImportError::FatalParse { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("expected 2 columns"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let err = read_records(b"a,b\n\xff,c\n", Separator::Comma, false, 2).unwrap_err();
        assert!(matches!(err, ImportError::FatalParse { line: 2, .. }));
    }
}
