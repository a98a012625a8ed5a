use std::io::{Cursor, Read};

use bytes::Bytes;
use common::error::AppError;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;

/// Reads the PDF text layer off the async executor.
///
/// Scanned PDFs without a text layer are reported as unparseable.
pub async fn extract_pdf_text(pdf_bytes: Bytes) -> Result<String, AppError> {
    let text = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&pdf_bytes).map(|s| s.trim().to_string())
    })
    .await
    .map_err(|err| AppError::UnparseableDocument(format!("PDF reader aborted: {err}")))?
    .map_err(|err| AppError::UnparseableDocument(format!("Failed to read PDF: {err}")))?;

    if text.is_empty() {
        return Err(AppError::UnparseableDocument(
            "PDF has no extractable text layer".into(),
        ));
    }

    Ok(normalize_text(&text))
}

pub fn decode_csv(bytes: &[u8]) -> Result<String, AppError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| AppError::UnparseableDocument(format!("CSV is not valid UTF-8: {err}")))?;
    let text = text.trim_start_matches('\u{feff}').trim();

    if text.is_empty() {
        return Err(AppError::UnparseableDocument("CSV file is empty".into()));
    }

    Ok(text.replace("\r\n", "\n"))
}

/// Flattens every worksheet of an XLSX workbook into tab-separated rows.
pub async fn flatten_xlsx(bytes: Bytes) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || flatten_xlsx_blocking(&bytes)).await?
}

fn flatten_xlsx_blocking(bytes: &[u8]) -> Result<String, AppError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| AppError::UnparseableDocument(format!("Failed to open XLSX: {err}")))?;

    let shared_strings = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/sheet") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheet_names.sort_by_key(|name| sheet_number(name));

    if sheet_names.is_empty() {
        return Err(AppError::UnparseableDocument(
            "XLSX workbook contains no worksheets".into(),
        ));
    }

    let mut sections = Vec::with_capacity(sheet_names.len());
    for (index, name) in sheet_names.iter().enumerate() {
        let Some(xml) = read_entry(&mut archive, name)? else {
            continue;
        };
        let rows = parse_sheet_rows(&xml, &shared_strings)?;
        if rows.is_empty() {
            continue;
        }
        sections.push(format!("# Sheet {}\n{}", index + 1, rows.join("\n")));
    }

    if sections.is_empty() {
        return Err(AppError::UnparseableDocument("XLSX workbook is empty".into()));
    }

    Ok(sections.join("\n\n"))
}

fn sheet_number(name: &str) -> u32 {
    name.trim_start_matches("xl/worksheets/sheet")
        .trim_end_matches(".xml")
        .parse()
        .unwrap_or(u32::MAX)
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, AppError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(AppError::UnparseableDocument(format!(
                "Failed to read {name}: {err}"
            )))
        }
    };

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|err| AppError::UnparseableDocument(format!("Failed to read {name}: {err}")))?;
    Ok(Some(xml))
}

fn xml_error(err: quick_xml::Error) -> AppError {
    AppError::UnparseableDocument(format!("XLSX XML parsing error: {err}"))
}

/// Resolves `&amp;`-style predefined entities and `&#NNN;` character references.
fn resolve_reference(reference: &BytesRef) -> Result<String, AppError> {
    if let Some(ch) = reference.resolve_char_ref().map_err(xml_error)? {
        return Ok(ch.to_string());
    }
    let name = reference
        .decode()
        .map_err(|err| xml_error(err.into()))?;
    resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| AppError::UnparseableDocument(format!("Unknown XML entity &{name};")))
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, AppError> {
    let mut reader = Reader::from_str(xml);

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" => in_text = in_item,
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"t" => in_text = false,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(e) if in_text => {
                current.push_str(&e.decode().map_err(|err| xml_error(err.into()))?);
            }
            Event::GeneralRef(e) if in_text => current.push_str(&resolve_reference(&e)?),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

fn parse_sheet_rows(xml: &str, shared_strings: &[String]) -> Result<Vec<String>, AppError> {
    let mut reader = Reader::from_str(xml);

    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_kind = CellKind::Value;
    let mut capture = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_kind = CellKind::Value;
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"t" {
                            cell_kind = match attr.value.as_ref() {
                                b"s" => CellKind::Shared,
                                b"inlineStr" => CellKind::Inline,
                                _ => CellKind::Value,
                            };
                        }
                    }
                    row.push(String::new());
                }
                b"v" => capture = cell_kind != CellKind::Inline,
                b"t" => capture = cell_kind == CellKind::Inline,
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"row" => {
                    while row.last().is_some_and(|cell| cell.is_empty()) {
                        row.pop();
                    }
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                    }
                }
                b"c" => {
                    if let Some(cell) = row.last_mut() {
                        let raw = std::mem::take(cell);
                        *cell = match cell_kind {
                            CellKind::Shared => raw
                                .trim()
                                .parse::<usize>()
                                .ok()
                                .and_then(|idx| shared_strings.get(idx))
                                .map(|value| value.trim().to_string())
                                .unwrap_or_default(),
                            _ => raw.trim().to_string(),
                        };
                    }
                }
                b"v" | b"t" => capture = false,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"c" => row.push(String::new()),
            Event::Text(e) if capture => {
                let text = e.decode().map_err(|err| xml_error(err.into()))?;
                if let Some(cell) = row.last_mut() {
                    cell.push_str(&text);
                }
            }
            Event::GeneralRef(e) if capture => {
                let text = resolve_reference(&e)?;
                if let Some(cell) = row.last_mut() {
                    cell.push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn normalize_text(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn build_xlsx(entries: &[(&str, &str)]) -> Bytes {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, content) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .expect("start file");
                writer.write_all(content.as_bytes()).expect("write entry");
            }
            writer.finish().expect("finish zip");
        }
        Bytes::from(buffer.into_inner())
    }

    const SHARED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <si><t>Name</t></si>
  <si><t>Price</t></si>
  <si><r><rPr><b/></rPr><t>Flat White</t></r></si>
</sst>"#;

    const SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
    <row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>3.8</v></c></row>
    <row r="3"><c r="A3" t="inlineStr"><is><t>Mocha</t></is></c><c r="B3"><v>4.2</v></c></row>
  </sheetData>
</worksheet>"#;

    #[tokio::test]
    async fn flatten_xlsx_resolves_shared_and_inline_strings() {
        let bytes = build_xlsx(&[
            ("xl/sharedStrings.xml", SHARED),
            ("xl/worksheets/sheet1.xml", SHEET),
        ]);

        let text = flatten_xlsx(bytes).await.expect("flatten");

        assert_eq!(text, "# Sheet 1\nName\tPrice\nFlat White\t3.8\nMocha\t4.2");
    }

    #[tokio::test]
    async fn flatten_xlsx_resolves_entity_and_character_references() {
        let shared = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <si><t>Fish &amp; Chips</t></si>
  <si><t xml:space="preserve">Salt &quot;n&quot; Vinegar </t></si>
</sst>"#;
        let sheet = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>9.5</v></c></row>
    <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="inlineStr"><is><t>&lt;&#49;00g&gt;</t></is></c></row>
    <row r="3"><c r="A3" t="inlineStr"><is><t>Caf&#233; Cr&#xE8;me</t></is></c></row>
  </sheetData>
</worksheet>"#;
        let bytes = build_xlsx(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);

        let text = flatten_xlsx(bytes).await.expect("flatten");

        assert_eq!(
            text,
            "# Sheet 1\nFish & Chips\t9.5\nSalt \"n\" Vinegar\t<100g>\nCafé Crème"
        );
    }

    #[test]
    fn unknown_entity_is_unparseable() {
        let sheet = r#"<worksheet><sheetData>
  <row r="1"><c r="A1" t="inlineStr"><is><t>&nbsp;</t></is></c></row>
</sheetData></worksheet>"#;

        let err = parse_sheet_rows(sheet, &[]).expect_err("unknown entity");

        assert!(matches!(err, AppError::UnparseableDocument(_)));
    }

    #[tokio::test]
    async fn flatten_xlsx_rejects_non_zip_bytes() {
        let err = flatten_xlsx(Bytes::from_static(b"not a workbook"))
            .await
            .expect_err("invalid archive");

        assert!(matches!(err, AppError::UnparseableDocument(_)));
    }

    #[tokio::test]
    async fn corrupted_pdf_is_unparseable() {
        let err = extract_pdf_text(Bytes::from_static(b"%PDF-1.7\n\x00\x01garbage"))
            .await
            .expect_err("corrupted pdf");

        assert!(matches!(err, AppError::UnparseableDocument(_)));
    }

    #[test]
    fn decode_csv_strips_bom_and_normalizes_newlines() {
        let text = decode_csv("\u{feff}name,price\r\nLatte,4.5\r\n".as_bytes()).expect("csv");
        assert_eq!(text, "name,price\nLatte,4.5");

        assert!(matches!(
            decode_csv(&[0xff, 0xfe, 0x00]),
            Err(AppError::UnparseableDocument(_))
        ));
        assert!(decode_csv(b"   ").is_err());
    }
}
