use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use serde_json::Value;

use super::{Block, Properties};

/// One `table_rows_group` block per `excel_row_batch_size` rows per sheet,
/// each rendered as a markdown table with the header row repeated, matching
/// the table block shape the chunker's table handler already knows how to
/// split further. Sheets are read whole into memory; calamine doesn't offer
/// a streaming row reader for the legacy `.xls` format this parser also
/// accepts.
pub(super) fn parse(path: &Path, row_batch_size: usize) -> Result<(Vec<Block>, Properties), String> {
    let mut workbook =
        open_workbook_auto(path).map_err(|err| format!("failed to open spreadsheet: {err}"))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let mut properties = Properties::new();
    properties.insert("sheet_count".to_string(), Value::from(sheet_names.len()));

    let row_batch_size = row_batch_size.max(1);
    let mut blocks = Vec::new();
    let mut next_id = 1i64;

    for sheet_name in &sheet_names {
        let range = match workbook.worksheet_range(sheet_name) {
            Ok(range) => range,
            Err(err) => {
                tracing::warn!(sheet = %sheet_name, error = %err, "skipping unreadable sheet");
                continue;
            }
        };

        let mut rows = range.rows();
        let header = match rows.next() {
            Some(row) => row_to_strings(row),
            None => continue,
        };

        let data_rows: Vec<Vec<String>> = rows.map(row_to_strings).collect();
        for (batch_idx, batch) in data_rows.chunks(row_batch_size).enumerate() {
            let markdown = table_markdown(&header, batch);
            let start_row = batch_idx * row_batch_size + 1;
            let end_row = batch_idx * row_batch_size + batch.len();
            let mut block = Block::new(next_id, "table_rows_group", markdown);
            block.section = Some(sheet_name.clone());
            block.metadata.insert("sheet".to_string(), Value::String(sheet_name.clone()));
            block.metadata.insert("start_row".to_string(), Value::from(start_row));
            block.metadata.insert("end_row".to_string(), Value::from(end_row));
            blocks.push(block);
            next_id += 1;
        }
    }

    if blocks.is_empty() {
        return Err(format!("no rows extracted from {}", path.display()));
    }

    Ok((blocks, properties))
}

fn row_to_strings(row: &[Data]) -> Vec<String> {
    row.iter().map(|cell| cell.to_string().replace('|', "\\|")).collect()
}

fn table_markdown(header: &[String], rows: &[Vec<String>]) -> String {
    let mut markdown = String::new();
    markdown.push_str(&format!("| {} |\n", header.join(" | ")));
    markdown.push_str(&format!(
        "|{}|\n",
        header.iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
    ));
    for row in rows {
        markdown.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    markdown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_markdown_escapes_pipe_characters_already_replaced_upstream() {
        let header = vec!["name".to_string(), "note".to_string()];
        let rows = vec![vec!["alice".to_string(), "a \\| b".to_string()]];
        let markdown = table_markdown(&header, &rows);
        assert_eq!(markdown, "| name | note |\n| --- | --- |\n| alice | a \\| b |\n");
    }

    #[test]
    fn row_to_strings_escapes_raw_pipe_characters() {
        let row = vec![Data::String("a|b".to_string())];
        let strings = row_to_strings(&row);
        assert_eq!(strings, vec!["a\\|b".to_string()]);
    }
}
