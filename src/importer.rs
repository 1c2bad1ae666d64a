//! Importing recipients from uploaded spreadsheets.

use std::collections::HashSet;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::Serialize;

use crate::config::ImportSettings;
use crate::db::{self, address_key, looks_like_address, NewRecipient, DB};
use crate::{ErrorKind, Result};

/// A data row of an uploaded file: a name and an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    /// The row's number in the file, counting the header as row 1.
    pub number: usize,
    pub name: String,
    pub email: String,
}

/// A row that was rejected, and why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InvalidRow {
    pub row: usize,
    pub email: String,
    pub reason: String,
}

/// What to do with each row of an upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub staged: Vec<NewRecipient>,
    pub invalid: Vec<InvalidRow>,
    pub duplicates: Vec<String>,
}

/// The outcome of an import, as reported to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub message: String,
    pub emails_saved: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_rows: Vec<InvalidRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicate_emails: Vec<String>,
    pub duplicate_count: usize,
}

/// Reads the rows of an uploaded file, choosing a parser by the file's extension.
pub fn read_rows(filename: &str, data: &[u8], settings: &ImportSettings) -> Result<Vec<Row>> {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    if !settings.extensions.iter().any(|allowed| *allowed == ext) {
        return Err(ErrorKind::UnsupportedFileType(filename.to_string()).into());
    }
    if data.len() as u64 > settings.max_upload_bytes {
        return Err(ErrorKind::InvalidData(format!(
            "File is larger than the {} byte limit",
            settings.max_upload_bytes
        ))
        .into());
    }

    if ext == "csv" {
        read_csv(data)
    } else {
        read_workbook(data)
    }
}

fn read_csv(data: &[u8]) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let mut rows = Vec::new();
    // Numbered by record, like worksheet rows; the header is row 1.
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        rows.push(Row {
            number: i + 2,
            name: record.get(0).unwrap_or("").to_string(),
            email: record.get(1).unwrap_or("").to_string(),
        });
    }
    Ok(rows)
}

/// Reads the first worksheet of an Excel or OpenDocument workbook.
fn read_workbook(data: &[u8]) -> Result<Vec<Row>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(data.to_vec()))
        .map_err(|e| ErrorKind::InvalidSpreadsheet(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ErrorKind::InvalidSpreadsheet("the workbook has no worksheets".to_string()))?
        .map_err(|e| ErrorKind::InvalidSpreadsheet(e.to_string()))?;

    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    Ok(range
        .rows()
        .enumerate()
        .skip(1)
        .map(|(i, cells)| Row {
            number: first_row + i + 1,
            name: cell_text(cells.get(0)),
            email: cell_text(cells.get(1)),
        })
        .collect())
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        None | Some(Data::Empty) => String::new(),
        Some(Data::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

/// Sorts rows into those to insert, those that are invalid, and those already present. `existing`
/// holds the [`address_key`]s of the campaign's current recipients.
pub fn plan(rows: Vec<Row>, existing: &HashSet<String>) -> Plan {
    let mut seen = existing.clone();
    let mut plan = Plan::default();
    for row in rows {
        let email = row.email.trim();
        if email.is_empty() {
            plan.invalid.push(InvalidRow {
                row: row.number,
                email: String::new(),
                reason: "Missing email address".to_string(),
            });
        } else if !looks_like_address(email) {
            plan.invalid.push(InvalidRow {
                row: row.number,
                email: email.to_string(),
                reason: "Invalid email address".to_string(),
            });
        } else if !seen.insert(address_key(email)) {
            plan.duplicates.push(email.to_string());
        } else {
            let name = row.name.trim();
            plan.staged.push(NewRecipient {
                email_address: email.to_string(),
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
            });
        }
    }
    plan
}

/// Adds the rows of an upload to a campaign. Either every staged row is inserted, or none is.
pub async fn import(db: &DB, campaign_id: i32, rows: Vec<Row>) -> Result<ImportReport> {
    let plan = db
        .transaction(move |conn| {
            db::find_campaign(conn, campaign_id)?;
            let existing = db::recipient_keys(conn, campaign_id)?;
            let plan = plan(rows, &existing);
            db::insert_recipients(conn, campaign_id, &plan.staged)?;
            Ok(plan)
        })
        .await?;

    info!(
        "Imported {} recipients into campaign {} ({} invalid, {} duplicate)",
        plan.staged.len(),
        campaign_id,
        plan.invalid.len(),
        plan.duplicates.len()
    );
    Ok(ImportReport {
        message: "Emails saved successfully!".to_string(),
        emails_saved: plan.staged.len(),
        duplicate_count: plan.duplicates.len(),
        invalid_rows: plan.invalid,
        duplicate_emails: plan.duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewCampaign;

    fn row(number: usize, name: &str, email: &str) -> Row {
        Row {
            number,
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn plan_sorts_rows() {
        let existing: HashSet<String> = ["old@example.com".to_string()].iter().cloned().collect();
        let rows = vec![
            row(2, "Ada", "ada@example.com"),
            row(3, "Nobody", ""),
            row(4, "Bob", "bob-at-example.com"),
            row(5, "Old", " OLD@example.com"),
            row(6, "", "grace@example.com"),
            row(7, "Ada again", "Ada@Example.com"),
        ];
        let plan = plan(rows, &existing);

        let staged = plan
            .staged
            .iter()
            .map(|r| (r.email_address.as_str(), r.name.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            staged,
            vec![("ada@example.com", Some("Ada")), ("grace@example.com", None)]
        );
        let invalid = plan.invalid.iter().map(|r| r.row).collect::<Vec<_>>();
        assert_eq!(invalid, vec![3, 4]);
        assert_eq!(plan.duplicates, vec!["OLD@example.com", "Ada@Example.com"]);
    }

    #[test]
    fn csv_rows_are_numbered_like_the_sheet() {
        let data = b"Name,Email\nAda,ada@example.com\nBob , bob@example.com\nShort\n";
        let rows = read_rows("list.CSV", data, &ImportSettings::default()).expect("rows");
        assert_eq!(
            rows,
            vec![
                row(2, "Ada", "ada@example.com"),
                row(3, "Bob", "bob@example.com"),
                row(4, "Short", ""),
            ]
        );
    }

    #[test]
    fn csv_line_endings_do_not_shift_row_numbers() {
        let lf = "Name,Email\nAda,ada@example.com\nBob,bob@example.com\n";
        let crlf = lf.replace('\n', "\r\n");
        let settings = ImportSettings::default();
        let numbers = |data: &str| {
            read_rows("list.csv", data.as_bytes(), &settings)
                .expect("rows")
                .iter()
                .map(|r| r.number)
                .collect::<Vec<_>>()
        };
        assert_eq!(numbers(lf), vec![2, 3]);
        assert_eq!(numbers(&crlf), vec![2, 3]);
    }

    #[test]
    fn workbook_rows_are_read_from_the_first_sheet() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Name").expect("cell");
        sheet.write_string(0, 1, "Email").expect("cell");
        sheet.write_string(1, 0, " Ada ").expect("cell");
        sheet.write_string(1, 1, "ada@example.com").expect("cell");
        sheet.write_string(2, 1, "bob@example.com").expect("cell");
        sheet.write_number(3, 0, 42.0).expect("cell");
        sheet.write_string(3, 1, "answer@example.com").expect("cell");
        let data = workbook.save_to_buffer().expect("xlsx");

        let rows = read_rows("people.xlsx", &data, &ImportSettings::default()).expect("rows");
        assert_eq!(
            rows,
            vec![
                row(2, "Ada", "ada@example.com"),
                row(3, "", "bob@example.com"),
                row(4, "42", "answer@example.com"),
            ]
        );
    }

    #[test]
    fn unsupported_extensions_are_rejected_before_parsing() {
        for name in &["list.txt", "list", "list.csv.exe"] {
            let err = read_rows(name, b"Name,Email\n", &ImportSettings::default())
                .expect_err("unsupported");
            match *err.kind() {
                ErrorKind::UnsupportedFileType(_) => {}
                ref other => panic!("unexpected kind {:?}", other),
            }
        }
    }

    #[test]
    fn corrupt_workbooks_are_invalid() {
        let err = read_rows("list.xlsx", b"definitely not a zip file", &ImportSettings::default())
            .expect_err("corrupt");
        match *err.kind() {
            ErrorKind::InvalidSpreadsheet(_) => {}
            ref other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(err.status(), warp::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_uploads_are_rejected() {
        let settings = ImportSettings {
            max_upload_bytes: 8,
            ..ImportSettings::default()
        };
        let err = read_rows("list.csv", b"Name,Email\nAda,ada@example.com\n", &settings)
            .expect_err("too large");
        assert_eq!(err.status(), warp::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn importing_twice_adds_nothing_the_second_time() {
        let db = DB::connect(":memory:").expect("db");
        let id = db
            .create_campaign(NewCampaign {
                name: "Launch".to_string(),
                ..NewCampaign::default()
            })
            .await
            .expect("campaign")
            .campaign
            .id;
        let data = b"Name,Email\nAda,ada@example.com\nBob,bob@example.com\nEve,\n";
        let rows = read_rows("list.csv", data, &ImportSettings::default()).expect("rows");

        let report = import(&db, id, rows.clone()).await.expect("import");
        assert_eq!(report.emails_saved, 2);
        assert_eq!(report.invalid_rows.len(), 1);
        assert_eq!(report.duplicate_count, 0);

        let report = import(&db, id, rows).await.expect("import");
        assert_eq!(report.emails_saved, 0);
        assert_eq!(report.duplicate_count, 2);
        assert_eq!(db.list_recipients(id).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn unknown_campaigns_are_not_found() {
        let db = DB::connect(":memory:").expect("db");
        let err = import(&db, 42, vec![row(2, "Ada", "ada@example.com")])
            .await
            .expect_err("no campaign");
        assert_eq!(err.status(), warp::http::StatusCode::NOT_FOUND);
    }
}
