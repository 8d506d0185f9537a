use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::{BLOCK_SIZE, PAGE_SIZE};
use crate::catalog::Catalog;
use crate::filebuf::FileBuf;
use crate::logrec::{LogOp, LogRecord, format_xact_time};
use crate::page;
use crate::record;
use crate::schema::{ColumnSchema, RowLayout, TableInfo};
use crate::value;
use crate::vlf::VlfInfo;

/// One reconstructed statement with its transaction boundary times.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub begin: String,
    pub end: String,
    pub op: u8,
    pub query: String,
}

/// Joins parsed log records against the catalog's table layouts and emits
/// SQL text. Records whose partition id matches no table are ignored, and
/// any record whose row image fails to decode emits nothing.
pub struct Reconstructor<'a> {
    mdf: &'a FileBuf,
    catalog: &'a Catalog<'a>,
    pub queries: Vec<QueryRow>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(mdf: &'a FileBuf, catalog: &'a Catalog<'a>) -> Reconstructor<'a> {
        Reconstructor {
            mdf,
            catalog,
            queries: Vec::new(),
        }
    }

    pub fn recover(&mut self, records: &[LogRecord]) {
        info!("reconstruct log records");

        let times = transaction_times(records);
        let catalog = self.catalog;

        for table in &catalog.tables {
            if table.partition_id == 0 {
                continue;
            }

            let schemas = catalog.table_schemas(table.object_id);
            if schemas.is_empty() {
                continue;
            }
            let layout = RowLayout::analyze(&schemas);

            for rec in records
                .iter()
                .filter(|r| r.is_dml() && r.partition_id == table.partition_id)
            {
                let Some(query) = build_query(self.mdf, rec, table, &layout, &schemas) else {
                    debug!(
                        table = %table.name,
                        offset = rec.offset,
                        "log record did not decode, skipped"
                    );
                    continue;
                };

                let (begin, end) = times.get(&rec.transaction_id).cloned().unwrap_or_default();
                self.queries.push(QueryRow {
                    begin,
                    end,
                    op: rec.op,
                    query,
                });
            }
        }

        info!(queries = self.queries.len(), "reconstruction complete");
    }

    /// Write the CSV output. Rows carry begin time, end time, the operation
    /// name and the statement under a three-column header; nothing is
    /// written when no statement was reconstructed.
    pub fn export(&self, path: &Path) -> anyhow::Result<()> {
        if self.queries.is_empty() {
            info!("no statements reconstructed, skipping CSV output");
            return Ok(());
        }

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("create {}", path.display()))?;

        writer.write_record(["Begin Time", "End Time", "Query"])?;
        for row in &self.queries {
            let op = LogOp::from_u8(row.op)
                .map(|op| op.to_string())
                .unwrap_or_default();
            writer.write_record([
                row.begin.as_str(),
                row.end.as_str(),
                op.as_str(),
                row.query.as_str(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }
}

/// First BEGIN_XACT and first COMMIT_XACT time per transaction id, already
/// formatted; either may be empty.
fn transaction_times(records: &[LogRecord]) -> HashMap<[u8; 6], (String, String)> {
    let mut times: HashMap<[u8; 6], (Option<String>, Option<String>)> = HashMap::new();

    for rec in records {
        match LogOp::from_u8(rec.op) {
            Some(LogOp::LOP_BEGIN_XACT) => {
                times
                    .entry(rec.transaction_id)
                    .or_default()
                    .0
                    .get_or_insert_with(|| {
                        rec.begin_time
                            .map(|t| format_xact_time(&t))
                            .unwrap_or_default()
                    });
            }
            Some(LogOp::LOP_COMMIT_XACT) => {
                times
                    .entry(rec.transaction_id)
                    .or_default()
                    .1
                    .get_or_insert_with(|| {
                        rec.end_time
                            .map(|t| format_xact_time(&t))
                            .unwrap_or_default()
                    });
            }
            _ => {}
        }
    }

    times
        .into_iter()
        .map(|(id, (begin, end))| (id, (begin.unwrap_or_default(), end.unwrap_or_default())))
        .collect()
}

fn build_query(
    mdf: &FileBuf,
    rec: &LogRecord,
    table: &TableInfo,
    layout: &RowLayout,
    schemas: &[ColumnSchema],
) -> Option<String> {
    match LogOp::from_u8(rec.op)? {
        LogOp::LOP_INSERT_ROWS => {
            let values = decode_row(rec.row_log_content.first()?, layout, schemas)?;
            Some(format!(
                "insert into {} values ({})",
                table.name,
                values.join(",")
            ))
        }
        LogOp::LOP_DELETE_ROWS => {
            let values = decode_row(rec.row_log_content.first()?, layout, schemas)?;
            Some(format!(
                "delete from {} where {}",
                table.name,
                join_predicates(schemas, &values, " and ")
            ))
        }
        LogOp::LOP_MODIFY_ROW => {
            let (after, before) = update_row_images(mdf, rec, layout, schemas)?;
            Some(format!(
                "update {} set {} where {}",
                table.name,
                join_predicates(schemas, &after, ", "),
                join_predicates(schemas, &before, " and ")
            ))
        }
        _ => None,
    }
}

fn join_predicates(schemas: &[ColumnSchema], values: &[String], sep: &str) -> String {
    schemas
        .iter()
        .zip(values)
        .map(|(schema, value)| format!("{}={}", schema.name, value))
        .collect::<Vec<_>>()
        .join(sep)
}

fn decode_row(buf: &[u8], layout: &RowLayout, schemas: &[ColumnSchema]) -> Option<Vec<String>> {
    let cols = record::parse_row(buf, buf.len(), layout, schemas, PAGE_SIZE).ok()?;

    cols.iter()
        .zip(schemas)
        .map(|(col, schema)| value::decode(col, schema).ok())
        .collect()
}

/// Resolve the after and before value lists of a MODIFY_ROW record.
///
/// The current row image is fetched from the MDF page the record points at
/// (file id is ignored; only the primary data file is supported) and decoded
/// as the after state. The before state is the same image with the logged
/// `before` fragment spliced over the bytes at `offsetinrow`, provided they
/// still equal the logged `after` fragment.
fn update_row_images(
    mdf: &FileBuf,
    rec: &LogRecord,
    layout: &RowLayout,
    schemas: &[ColumnSchema],
) -> Option<(Vec<String>, Vec<String>)> {
    if rec.row_log_content.len() < 2 {
        return None;
    }
    let before = &rec.row_log_content[0];
    let after = &rec.row_log_content[1];

    let page_no = rec.page_id.0 as usize;
    let buf = mdf.block(page_no * PAGE_SIZE, PAGE_SIZE).ok()?;
    let (header, page) = page::read_repaired(buf).ok()?;

    let slots = page::raw_slot_array(&page, header.slot_cnt);
    let row_offset = *slots.get(rec.slot_id as usize)? as usize;
    if row_offset == 0 || row_offset >= page.len() {
        return None;
    }

    let record_len = record::calc_data_record_len(&page[row_offset..], layout);
    if record_len == 0 || row_offset + record_len > page.len() {
        return None;
    }
    let row = &page[row_offset..row_offset + record_len];

    let after_values = decode_row(row, layout, schemas)?;

    let mut before_row = row.to_vec();
    let at = rec.offset_in_row as usize;
    if at + after.len() <= before_row.len() && before_row[at..at + after.len()] == after[..] {
        before_row.splice(at..at + after.len(), before.iter().copied());
    }
    let before_values = decode_row(&before_row, layout, schemas)?;

    Some((after_values, before_values))
}

/// Dump the 0x40-byte prologue of every DML record found by the structured
/// walk into `result/<absolute offset>` under the working directory.
pub fn extract_records(
    ldf: &FileBuf,
    vlfs: &[VlfInfo],
    records: &[LogRecord],
) -> anyhow::Result<()> {
    let dir = std::env::current_dir()?.join("result");
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let mut written = 0usize;
    for rec in records.iter().filter(|r| r.is_dml()) {
        let Some(vlf) = vlfs.iter().find(|v| v.seqnum == rec.vlf_seqnum) else {
            continue;
        };

        let offset = vlf.offset + BLOCK_SIZE * rec.block_num + rec.offset;
        let Ok(buf) = ldf.block(offset, 0x40) else {
            continue;
        };

        std::fs::write(dir.join(offset.to_string()), buf)?;
        written += 1;
    }

    info!(written, "extracted record prologues to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::schema::SqlType;

    fn column(ordinal: u16, name: &str, ty: SqlType, col_size: u16) -> ColumnSchema {
        ColumnSchema {
            object_id: 9,
            ordinal,
            xtype: 0,
            utype: 0,
            col_size,
            name: name.to_string(),
            ty,
            is_max: false,
            precision: 0,
            scale: 0,
        }
    }

    /// t(id int, name varchar)
    fn table_t() -> (TableInfo, Vec<ColumnSchema>, RowLayout) {
        let schemas = vec![
            column(1, "id", SqlType::Int, 4),
            column(2, "name", SqlType::VarChar, 0x10),
        ];
        let layout = RowLayout::analyze(&schemas);
        let table = TableInfo {
            object_id: 9,
            name: "t".to_string(),
            num_columns: 2,
            pobject_id: 0,
            partition_id: 0x1234,
        };
        (table, schemas, layout)
    }

    /// Row image of `(id, name)` for table `t`.
    fn row_image(id: u32, name: &str) -> Vec<u8> {
        let mut row = vec![0x30u8, 0x00];
        row.extend_from_slice(&8u16.to_le_bytes());
        row.extend_from_slice(&id.to_le_bytes());
        row.extend_from_slice(&2u16.to_le_bytes());
        row.push(0);
        row.extend_from_slice(&1u16.to_le_bytes());
        let end = (15 + name.len()) as u16;
        row.extend_from_slice(&end.to_le_bytes());
        row.extend_from_slice(name.as_bytes());
        row
    }

    fn dml_record(op: LogOp, content: Vec<Vec<u8>>) -> LogRecord {
        LogRecord {
            op: op as u8,
            partition_id: 0x1234,
            row_log_content: content,
            ..LogRecord::default()
        }
    }

    fn empty_mdf() -> (tempfile::NamedTempFile, FileBuf) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; PAGE_SIZE]).unwrap();
        file.flush().unwrap();
        let buf = FileBuf::open(file.path()).unwrap();
        (file, buf)
    }

    /// MDF with one data page holding the row at slot 0.
    fn mdf_with_row(row: &[u8]) -> (tempfile::NamedTempFile, FileBuf) {
        let mut page = vec![0u8; PAGE_SIZE];
        page[1] = page::PAGE_TYPE_DATA;
        page[22..24].copy_from_slice(&1u16.to_le_bytes());
        page[96..96 + row.len()].copy_from_slice(row);
        page[PAGE_SIZE - 2..].copy_from_slice(&96u16.to_le_bytes());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&page).unwrap();
        file.flush().unwrap();
        let buf = FileBuf::open(file.path()).unwrap();
        (file, buf)
    }

    #[test]
    fn test_insert_statement() {
        let (table, schemas, layout) = table_t();
        let (_file, mdf) = empty_mdf();
        let rec = dml_record(LogOp::LOP_INSERT_ROWS, vec![row_image(7, "hi")]);

        let query = build_query(&mdf, &rec, &table, &layout, &schemas).unwrap();
        assert_eq!(query, "insert into t values ('7','hi')");
    }

    #[test]
    fn test_delete_statement() {
        let (table, schemas, layout) = table_t();
        let (_file, mdf) = empty_mdf();
        let rec = dml_record(LogOp::LOP_DELETE_ROWS, vec![row_image(7, "hi")]);

        let query = build_query(&mdf, &rec, &table, &layout, &schemas).unwrap();
        assert_eq!(query, "delete from t where id='7' and name='hi'");
    }

    #[test]
    fn test_update_statement_rebuilds_pre_image() {
        let (table, schemas, layout) = table_t();

        // the page holds the current (after) image: name changed to "ok"
        let (_file, mdf) = mdf_with_row(&row_image(7, "ok"));

        let mut rec = dml_record(
            LogOp::LOP_MODIFY_ROW,
            vec![b"hi".to_vec(), b"ok".to_vec()],
        );
        rec.page_id = (0, 1);
        rec.slot_id = 0;
        rec.offset_in_row = 15; // start of the name payload

        let query = build_query(&mdf, &rec, &table, &layout, &schemas).unwrap();
        assert_eq!(
            query,
            "update t set id='7', name='ok' where id='7' and name='hi'"
        );
    }

    #[test]
    fn test_update_with_missing_fragment_emits_nothing() {
        let (table, schemas, layout) = table_t();
        let (_file, mdf) = mdf_with_row(&row_image(7, "ok"));

        let rec = dml_record(LogOp::LOP_MODIFY_ROW, vec![b"hi".to_vec()]);
        assert!(build_query(&mdf, &rec, &table, &layout, &schemas).is_none());
    }

    #[test]
    fn test_update_with_bad_slot_emits_nothing() {
        let (table, schemas, layout) = table_t();
        let (_file, mdf) = mdf_with_row(&row_image(7, "ok"));

        let mut rec = dml_record(
            LogOp::LOP_MODIFY_ROW,
            vec![b"hi".to_vec(), b"ok".to_vec()],
        );
        rec.slot_id = 5;

        assert!(build_query(&mdf, &rec, &table, &layout, &schemas).is_none());
    }

    #[test]
    fn test_undecodable_row_emits_nothing() {
        let (table, schemas, layout) = table_t();
        let (_file, mdf) = empty_mdf();

        // column count in the row image disagrees with the layout
        let mut row = row_image(7, "hi");
        row[8..10].copy_from_slice(&9u16.to_le_bytes());
        let rec = dml_record(LogOp::LOP_INSERT_ROWS, vec![row]);

        assert!(build_query(&mdf, &rec, &table, &layout, &schemas).is_none());
    }

    #[test]
    fn test_transaction_times_take_first_begin_and_commit() {
        let id = [1, 2, 3, 4, 5, 6];
        let mut begin = LogRecord {
            op: LogOp::LOP_BEGIN_XACT as u8,
            transaction_id: id,
            begin_time: crate::logrec::xact_time(1, 300),
            ..LogRecord::default()
        };
        let commit = LogRecord {
            op: LogOp::LOP_COMMIT_XACT as u8,
            transaction_id: id,
            end_time: crate::logrec::xact_time(2, 600),
            ..LogRecord::default()
        };

        let times = transaction_times(&[begin.clone(), commit.clone()]);
        assert_eq!(
            times[&id],
            (
                "01/02/1900 00:00:01.000000".to_string(),
                "01/03/1900 00:00:02.000000".to_string()
            )
        );

        // a later begin does not override the first
        begin.begin_time = crate::logrec::xact_time(9, 0);
        let times = transaction_times(&[
            LogRecord {
                op: LogOp::LOP_BEGIN_XACT as u8,
                transaction_id: id,
                begin_time: crate::logrec::xact_time(1, 300),
                ..LogRecord::default()
            },
            begin,
            commit,
        ]);
        assert_eq!(times[&id].0, "01/02/1900 00:00:01.000000");
    }

    #[test]
    fn test_transaction_without_boundaries_is_empty() {
        let times = transaction_times(&[dml_record(LogOp::LOP_INSERT_ROWS, vec![])]);
        assert!(times.is_empty());
    }
}
