//! Parts-list parsing for bulk-upload jobs.
//!
//! The file is CSV with a header row: column 1 is the part number, column 2
//! the PDF URL. Invalid rows are rejected up-front and reported in the job
//! creation response rather than failing later inside the worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartsListError {
    #[error("unreadable parts list: {0}")]
    Unreadable(String),
    #[error("parts list contains no valid rows")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartsRow {
    pub part_number: String,
    pub pdf_url: String,
}

#[derive(Debug, Clone)]
pub struct ParsedPartsList {
    pub rows: Vec<PartsRow>,
    pub rejected: usize,
}

/// Parse and validate a parts-list file. The header row is skipped; a row
/// survives when the part number is non-empty and the URL is http(s).
pub fn parse_parts_list(bytes: &[u8]) -> Result<ParsedPartsList, PartsListError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    let mut rejected = 0;

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                rejected += 1;
                continue;
            }
        };
        let part_number = record.get(0).unwrap_or("").trim();
        let pdf_url = record.get(1).unwrap_or("").trim();

        if part_number.is_empty() || !is_http_url(pdf_url) {
            rejected += 1;
            continue;
        }
        rows.push(PartsRow {
            part_number: part_number.to_string(),
            pdf_url: pdf_url.to_string(),
        });
    }

    if rows.is_empty() && rejected == 0 {
        return Err(PartsListError::Empty);
    }
    Ok(ParsedPartsList { rows, rejected })
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rows() {
        let csv = b"Part Number,PDF URL\n\
                    AB-100,https://acme.example.com/docs/ab-100.pdf\n\
                    AB-200,http://acme.example.com/docs/ab-200.pdf\n";
        let parsed = parse_parts_list(csv).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rejected, 0);
        assert_eq!(parsed.rows[0].part_number, "AB-100");
    }

    #[test]
    fn test_invalid_rows_rejected_with_count() {
        let csv = b"part,url\n\
                    ,https://acme.example.com/a.pdf\n\
                    AB-1,ftp://acme.example.com/b.pdf\n\
                    AB-2,not-a-url\n\
                    AB-3,https://acme.example.com/c.pdf\n";
        let parsed = parse_parts_list(csv).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rejected, 3);
        assert_eq!(parsed.rows[0].part_number, "AB-3");
    }

    #[test]
    fn test_header_only_is_empty() {
        let csv = b"part,url\n";
        assert!(matches!(
            parse_parts_list(csv),
            Err(PartsListError::Empty)
        ));
    }

    #[test]
    fn test_whitespace_trimmed() {
        let csv = b"part,url\n  AB-9  ,  https://a.example.com/x.pdf \n";
        let parsed = parse_parts_list(csv).unwrap();
        assert_eq!(parsed.rows[0].part_number, "AB-9");
        assert_eq!(parsed.rows[0].pdf_url, "https://a.example.com/x.pdf");
    }
}
