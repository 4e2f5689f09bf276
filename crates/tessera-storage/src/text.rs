//! Text dump and reload format for rows.
//!
//! A row renders as `Table=<name>,row=<id>,<field>=<value>,...`. Values
//! escape `=` as `&eq;` and `,` as `&cm;` so they can hold either
//! separator. `&` itself is escaped as `&amp;` so the escapes stay
//! unambiguous.

use crate::record::Record;
use tessera_common::{Result, RowId, TesseraError};

/// Key that names the table.
pub const TABLE_KEY: &str = "Table";

/// Key that carries the row id.
pub const ROW_KEY: &str = "row";

/// Escapes separators inside a value.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '=' => out.push_str("&eq;"),
            ',' => out.push_str("&cm;"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if let Some(tail) = rest.strip_prefix("&eq;") {
            out.push('=');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&cm;") {
            out.push(',');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&amp;") {
            out.push('&');
            rest = tail;
        } else {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Renders a record as one text line.
pub fn format_row<R: Record>(record: &R) -> String {
    let mut line = format!("{}={}", TABLE_KEY, escape(R::TABLE_NAME));
    if let Some(row) = record.row() {
        line.push_str(&format!(",{}={}", ROW_KEY, row));
    }
    for field in R::fields() {
        line.push(',');
        line.push_str(field.name);
        line.push('=');
        line.push_str(&escape(&(field.to_text)(record)));
    }
    line
}

/// A parsed text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRow {
    pub table: String,
    pub row: Option<RowId>,
    pub fields: Vec<(String, String)>,
}

/// Parses a line produced by [`format_row`].
pub fn parse_row(line: &str) -> Result<TextRow> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split(',');
    let table = match parts.next().and_then(|p| p.split_once('=')) {
        Some((TABLE_KEY, name)) => unescape(name),
        _ => return Err(TesseraError::MalformedRow(format!("missing {TABLE_KEY} key"))),
    };

    let mut row = None;
    let mut fields = Vec::new();
    for part in parts {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| TesseraError::MalformedRow(format!("no '=' in {part:?}")))?;
        if key == ROW_KEY {
            let parsed = value.parse::<RowId>().map_err(|_| TesseraError::InvalidFieldValue {
                field: ROW_KEY.to_string(),
                value: value.to_string(),
            })?;
            row = Some(parsed);
        } else {
            fields.push((key.to_string(), unescape(value)));
        }
    }
    Ok(TextRow { table, row, fields })
}

/// Builds a detached record from a parsed line.
pub fn build_record<R: Record>(text: &TextRow) -> Result<R> {
    let mut record = R::default();
    for (name, value) in &text.fields {
        record.set(name, value)?;
    }
    record.set_row(text.row);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{compare_key, FixedString, KeyMatch};
    use std::cmp::Ordering;

    crate::define_record! {
        pub struct Note = "Note" {
            [TITLE = 0] index title: Option<FixedString<16>>,
            [SCORE = 1] plain score: f64,
        }
        indices {
            "PrimaryKey" => Note::by_title,
        }
    }

    impl Note {
        fn by_title(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.title, &b.title, m)
        }
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = "a=b,c&d&eq;";
        let escaped = escape(raw);
        assert!(!escaped.contains('='));
        assert!(!escaped.contains(','));
        assert_eq!(unescape(&escaped), raw);
        assert_eq!(unescape("x&y"), "x&y");
    }

    #[test]
    fn test_format_row() {
        let mut note = Note {
            title: Some(FixedString::new("x=1,y")),
            score: 1.5,
            ..Default::default()
        };
        note.set_row(Some(12));
        assert_eq!(
            format_row(&note),
            "Table=Note,row=12,title=x&eq;1&cm;y,score=1.5"
        );
    }

    #[test]
    fn test_parse_and_build() {
        let parsed = parse_row("Table=Note,row=3,title=hi&cm;there,score=-2\n").unwrap();
        assert_eq!(parsed.table, "Note");
        assert_eq!(parsed.row, Some(3));
        assert_eq!(parsed.fields[0], ("title".to_string(), "hi,there".to_string()));

        let note: Note = build_record(&parsed).unwrap();
        assert_eq!(note.title.unwrap().as_str(), "hi,there");
        assert_eq!(note.score, -2.0);
        assert_eq!(note.row(), Some(3));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_row("row=1,title=x"),
            Err(TesseraError::MalformedRow(_))
        ));
        assert!(matches!(
            parse_row("Table=Note,title"),
            Err(TesseraError::MalformedRow(_))
        ));
        assert!(matches!(
            parse_row("Table=Note,row=abc"),
            Err(TesseraError::InvalidFieldValue { .. })
        ));

        let parsed = parse_row("Table=Note,bogus=1").unwrap();
        assert!(build_record::<Note>(&parsed).is_err());
    }
}
