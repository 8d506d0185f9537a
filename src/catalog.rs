use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::io::Result;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::PAGE_SIZE;
use crate::filebuf::FileBuf;
use crate::page::{self, PageHeader};
use crate::raw;
use crate::record::{self, ColumnSlice};
use crate::schema::{ColumnSchema, RowLayout, SqlType, TableInfo};

/// Object ids of the system tables the bootstrap needs.
pub const SYSROWSETS_ID: u32 = 0x05;
pub const SYSALLOCUNITS_ID: u32 = 0x07;
pub const SYSSCHOBJS_ID: u32 = 0x22;
pub const SYSCOLPARS_ID: u32 = 0x29;
pub const SYSISCOLS_ID: u32 = 0x37;

/// System tables whose layouts are booted from raw `syscolpars` rows.
/// `syscolpars` itself is decoded by fixed offsets, so it needs no entry.
const BOOT_TABLES: [(&str, u32); 4] = [
    ("sysschobjs", SYSSCHOBJS_ID),
    ("sysiscols", SYSISCOLS_ID),
    ("sysrowsets", SYSROWSETS_ID),
    ("sysallocunits", SYSALLOCUNITS_ID),
];

// Fixed offsets inside a syscolpars row. The owning object id is the row's
// first static column; the descriptor length sits in front of the UTF-16
// column name.
const COLPAR_OBJECT_ID: usize = 0x04;
const COLPAR_ORDINAL: usize = 0x0A;
const COLPAR_XTYPE: usize = 0x0E;
const COLPAR_UTYPE: usize = 0x0F;
const COLPAR_COLSIZE: usize = 0x13;
const COLPAR_PRECISION: usize = 0x15;
const COLPAR_SCALE: usize = 0x16;
const COLPAR_RECORD_LEN: usize = 0x33;
const COLPAR_NAME: usize = 0x35;

/// Census of data pages: page number to owning object id. Persisted next to
/// the MDF as JSON so later runs skip the full scan.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageMap(pub BTreeMap<u32, u32>);

/// The rebuilt catalog: which pages belong to which object, the booted
/// system-table layouts, and every user table with its columns and
/// partition identity.
pub struct Catalog<'a> {
    mdf: &'a FileBuf,
    pages: PageMap,
    system_schemas: HashMap<u32, Vec<ColumnSchema>>,
    user_schemas: HashMap<u32, Vec<ColumnSchema>>,
    pub tables: Vec<TableInfo>,
}

/// Run the full bootstrap. Failing to resolve any user table is fatal;
/// everything downstream needs the layouts produced here.
pub fn bootstrap<'a>(mdf: &'a FileBuf, mdf_path: &Path) -> anyhow::Result<Catalog<'a>> {
    let mut catalog = Catalog::new(mdf);

    catalog.scan_pages(mdf_path);
    catalog.boot_system_schemas();

    if !catalog.load_tables() {
        return Err(anyhow::anyhow!(
            "catalog bootstrap failed: no user tables resolved from sysschobjs"
        ));
    }

    catalog.load_columns();
    if !catalog.load_key_columns() {
        debug!("sysiscols layout unavailable, keeping declared column order");
    }
    if !catalog.bind_partitions() {
        debug!("sysrowsets/sysallocunits layout unavailable, partition ids unresolved");
    }

    Ok(catalog)
}

impl<'a> Catalog<'a> {
    pub fn new(mdf: &'a FileBuf) -> Catalog<'a> {
        Catalog {
            mdf,
            pages: PageMap::default(),
            system_schemas: HashMap::new(),
            user_schemas: HashMap::new(),
            tables: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.mdf.len() / PAGE_SIZE
    }

    /// Census of every data page, mapping page number to object id. A cache
    /// file next to the MDF is authoritative when its page numbers fit the
    /// current file; otherwise the file is rescanned and the cache rewritten.
    pub fn scan_pages(&mut self, mdf_path: &Path) {
        info!("MDF page scan");

        let cache_path = mdf_path.with_extension("json");
        if let Some(pages) = load_page_cache(&cache_path, self.page_count()) {
            info!(pages = pages.0.len(), "loaded page map from {}", cache_path.display());
            self.pages = pages;
            return;
        }

        for page_no in 0..self.page_count() {
            let Ok(buf) = self.mdf.block(page_no * PAGE_SIZE, PAGE_SIZE) else {
                break;
            };

            if buf[1] != page::PAGE_TYPE_DATA {
                continue;
            }

            let Ok(header) = PageHeader::parse(buf) else {
                continue;
            };
            self.pages.0.insert(page_no as u32, header.object_id);
        }

        match std::fs::File::create(&cache_path) {
            Ok(file) => {
                if let Err(err) = serde_json::to_writer(file, &self.pages) {
                    warn!("failed to write page map cache: {err}");
                }
            }
            Err(err) => warn!("failed to create {}: {err}", cache_path.display()),
        }
    }

    /// Derive the layouts of the boot system tables from the `syscolpars`
    /// rows that describe them.
    pub fn boot_system_schemas(&mut self) {
        info!("system table column scan");

        for (name, target) in BOOT_TABLES {
            let mut schemas = Vec::new();

            for page_no in self.object_pages(SYSCOLPARS_ID) {
                let Ok((header, page)) = self.load_page(page_no) else {
                    continue;
                };

                for offset in page::slot_array(&page, header.slot_cnt) {
                    if let Some(schema) = parse_column_descriptor(&page, offset as usize, target) {
                        schemas.push(schema);
                    }
                }
            }

            debug!(table = name, columns = schemas.len(), "booted system schema");
            self.system_schemas.insert(target, schemas);
        }
    }

    /// Decode `sysschobjs` against its booted layout and keep the user
    /// tables (`type == 'U'`). False when the layout could not be resolved
    /// or no table survived -- both fatal for the bootstrap.
    pub fn load_tables(&mut self) -> bool {
        info!("user table scan");

        let Some((schemas, layout)) = self.system_layout(SYSSCHOBJS_ID) else {
            return false;
        };

        for page_no in self.object_pages(SYSSCHOBJS_ID) {
            let Ok((header, page)) = self.load_page(page_no) else {
                continue;
            };

            for (offset, len) in record_bounds(&page, header.slot_cnt) {
                let Ok(cols) = record::parse_row(&page[offset..], len, &layout, &schemas, PAGE_SIZE)
                else {
                    continue;
                };

                if let Some(table) = table_from_row(&cols, &schemas) {
                    self.tables.push(table);
                }
            }
        }

        info!(tables = self.tables.len(), "resolved user tables");
        !self.tables.is_empty()
    }

    /// Collect the `syscolpars` descriptors of every user table.
    pub fn load_columns(&mut self) {
        info!("user column scan");

        let pages = self.object_pages(SYSCOLPARS_ID);

        for object_id in self.table_ids() {
            let mut schemas = Vec::new();

            for &page_no in &pages {
                let Ok((header, page)) = self.load_page(page_no) else {
                    continue;
                };

                for offset in page::slot_array(&page, header.slot_cnt) {
                    if let Some(schema) = parse_column_descriptor(&page, offset as usize, object_id)
                    {
                        schemas.push(schema);
                    }
                }
            }

            self.user_schemas.insert(object_id, schemas);
        }
    }

    /// Apply index-key ordinal corrections from `sysiscols`: a row with
    /// `status & 2` maps a column (`intprop`) to its physical position
    /// (`subid`); the column moves there and the ordinals in between shift
    /// by one. This establishes the order the row decoder walks columns in.
    pub fn load_key_columns(&mut self) -> bool {
        info!("index key column scan");

        let Some((schemas, layout)) = self.system_layout(SYSISCOLS_ID) else {
            return false;
        };

        let pages = self.object_pages(SYSISCOLS_ID);

        for object_id in self.table_ids() {
            let mut moves = Vec::new();

            for &page_no in &pages {
                let Ok((header, page)) = self.load_page(page_no) else {
                    continue;
                };

                for (offset, len) in record_bounds(&page, header.slot_cnt) {
                    let Ok(cols) =
                        record::parse_row(&page[offset..], len, &layout, &schemas, PAGE_SIZE)
                    else {
                        continue;
                    };

                    let Some((index_column_id, column_id)) =
                        index_key_from_row(&cols, &schemas, object_id)
                    else {
                        continue;
                    };

                    if index_column_id != 0 && column_id != 0 && index_column_id != column_id {
                        moves.push((index_column_id, column_id));
                    }
                }
            }

            if let Some(table_schemas) = self.user_schemas.get_mut(&object_id) {
                for (new, old) in moves {
                    change_ordinal(table_schemas, new, old);
                }
            }
        }

        true
    }

    /// Resolve each table's partition id from `sysrowsets` and its HoBT
    /// allocation unit from `sysallocunits`.
    pub fn bind_partitions(&mut self) -> bool {
        info!("partition scan");

        let Some((rowset_schemas, rowset_layout)) = self.system_layout(SYSROWSETS_ID) else {
            return false;
        };
        let Some((alloc_schemas, alloc_layout)) = self.system_layout(SYSALLOCUNITS_ID) else {
            return false;
        };

        let rowset_pages = self.object_pages(SYSROWSETS_ID);
        let alloc_pages = self.object_pages(SYSALLOCUNITS_ID);
        let mut resolved: HashMap<u32, (u64, u64)> = HashMap::new();

        'tables: for object_id in self.table_ids() {
            for &page_no in &rowset_pages {
                let Ok((header, page)) = self.load_page(page_no) else {
                    continue;
                };

                for (offset, len) in record_bounds(&page, header.slot_cnt) {
                    let Ok(cols) = record::parse_row(
                        &page[offset..],
                        len,
                        &rowset_layout,
                        &rowset_schemas,
                        PAGE_SIZE,
                    ) else {
                        continue;
                    };

                    let Some(partition_id) = rowset_from_row(&cols, &rowset_schemas, object_id)
                    else {
                        continue;
                    };

                    let pobject_id = self
                        .find_alloc_unit(&alloc_pages, &alloc_schemas, &alloc_layout, partition_id)
                        .map(|auid| (auid & 0xFFFF_FFFF_FFFF) >> 16)
                        .unwrap_or(0);

                    resolved.insert(object_id, (partition_id, pobject_id));
                    continue 'tables;
                }
            }
        }

        for table in &mut self.tables {
            if let Some(&(partition_id, pobject_id)) = resolved.get(&table.object_id) {
                table.partition_id = partition_id;
                table.pobject_id = pobject_id;
                debug!(
                    table = %table.name,
                    partition_id, pobject_id, "bound partition"
                );
            }
        }

        true
    }

    /// The allocation unit owned by the partition, restricted to in-row data
    /// (`type == 0x01`, the HoBT allocation unit).
    fn find_alloc_unit(
        &self,
        pages: &[u32],
        schemas: &[ColumnSchema],
        layout: &RowLayout,
        partition_id: u64,
    ) -> Option<u64> {
        for &page_no in pages {
            let Ok((header, page)) = self.load_page(page_no) else {
                continue;
            };

            for (offset, len) in record_bounds(&page, header.slot_cnt) {
                let Ok(cols) = record::parse_row(&page[offset..], len, layout, schemas, PAGE_SIZE)
                else {
                    continue;
                };

                if let Some(auid) = alloc_from_row(&cols, schemas, partition_id) {
                    return Some(auid);
                }
            }
        }

        None
    }

    /// Columns of one user table, sorted by (fixed-up) ordinal.
    pub fn table_schemas(&self, object_id: u32) -> Vec<ColumnSchema> {
        let mut schemas = self
            .user_schemas
            .get(&object_id)
            .cloned()
            .unwrap_or_default();
        schemas.sort_by_key(|s| s.ordinal);
        schemas
    }

    pub fn pages(&self) -> &PageMap {
        &self.pages
    }

    fn table_ids(&self) -> Vec<u32> {
        self.tables.iter().map(|t| t.object_id).collect()
    }

    fn object_pages(&self, object_id: u32) -> Vec<u32> {
        self.pages
            .0
            .iter()
            .filter(|&(_, &v)| v == object_id)
            .map(|(&k, _)| k)
            .collect()
    }

    fn load_page(&self, page_no: u32) -> Result<(PageHeader, Cow<'a, [u8]>)> {
        let mdf: &'a FileBuf = self.mdf;
        page::read_repaired(mdf.block(page_no as usize * PAGE_SIZE, PAGE_SIZE)?)
    }

    /// System-table schemas sorted by ordinal plus the derived layout,
    /// validated against the booted column count.
    fn system_layout(&self, object_id: u32) -> Option<(Vec<ColumnSchema>, RowLayout)> {
        let mut schemas = self.system_schemas.get(&object_id)?.clone();
        if schemas.is_empty() {
            return None;
        }
        schemas.sort_by_key(|s| s.ordinal);

        let layout = RowLayout::analyze(&schemas);
        if schemas.len() != layout.total_cols {
            return None;
        }

        Some((schemas, layout))
    }
}

fn load_page_cache(path: &Path, page_count: usize) -> Option<PageMap> {
    let file = std::fs::File::open(path).ok()?;
    let pages: PageMap = match serde_json::from_reader(file) {
        Ok(pages) => pages,
        Err(err) => {
            warn!("ignoring unreadable page map cache {}: {err}", path.display());
            return None;
        }
    };

    // a cache describing more pages than the file holds is stale
    if let Some(&last) = pages.0.keys().next_back()
        && last as usize >= page_count
    {
        warn!("page map cache {} does not match the MDF, rescanning", path.display());
        return None;
    }

    Some(pages)
}

/// Row offsets paired with the span to the next row (the last row runs to
/// the start of the slot array).
fn record_bounds(page: &[u8], slot_cnt: u16) -> Vec<(usize, usize)> {
    let offsets = page::slot_array(page, slot_cnt);
    let tail = page.len() - offsets.len() * 2;

    offsets
        .iter()
        .enumerate()
        .filter_map(|(i, &offset)| {
            let offset = offset as usize;
            let end = offsets
                .get(i + 1)
                .map(|&next| next as usize)
                .unwrap_or(tail);
            (offset < page.len() && end > offset).then_some((offset, end - offset))
        })
        .collect()
}

/// Decode one `syscolpars` row into a column descriptor when it belongs to
/// `object_id`. Rows with a zero descriptor length are skipped.
fn parse_column_descriptor(page: &[u8], offset: usize, object_id: u32) -> Option<ColumnSchema> {
    if offset + COLPAR_NAME > page.len() {
        return None;
    }
    if raw::read_u32(&page[offset + COLPAR_OBJECT_ID..]) != object_id {
        return None;
    }

    let len = raw::read_u16(&page[offset + COLPAR_RECORD_LEN..]) as usize;
    if len == 0 || len < COLPAR_SCALE + 1 || offset + len > page.len() {
        return None;
    }

    let rec = &page[offset..offset + len];
    let ordinal = raw::read_u16(&rec[COLPAR_ORDINAL..]);
    let xtype = rec[COLPAR_XTYPE];
    let utype = raw::read_u32(&rec[COLPAR_UTYPE..]);

    let mut col_size = raw::read_u16(&rec[COLPAR_COLSIZE..]);
    let mut is_max = false;
    if col_size == 0xFFFF {
        // varchar(max) and friends keep a 16-byte in-row pointer
        col_size = 0x10;
        is_max = true;
    }

    let ty = SqlType::from_xtype(xtype, utype);
    let mut precision = 0;
    let mut scale = 0;
    if ty.has_numeric_precision() {
        precision = rec[COLPAR_PRECISION];
        scale = rec[COLPAR_SCALE];
    } else if ty.has_time_scale() {
        scale = rec[COLPAR_SCALE];
    }

    let name = if len > COLPAR_NAME {
        raw::read_utf16(&rec[COLPAR_NAME..]).ok()?
    } else {
        String::new()
    };

    Some(ColumnSchema {
        object_id,
        ordinal,
        xtype,
        utype,
        col_size,
        name,
        ty,
        is_max,
        precision,
        scale,
    })
}

fn read_u32_col(col: &ColumnSlice<'_>) -> Option<u32> {
    (col.buf.len() >= 4).then(|| raw::read_u32(col.buf))
}

fn read_u64_col(col: &ColumnSlice<'_>) -> Option<u64> {
    (col.buf.len() >= 8).then(|| raw::read_u64(col.buf))
}

fn table_from_row(cols: &[ColumnSlice<'_>], schemas: &[ColumnSchema]) -> Option<TableInfo> {
    let mut table = TableInfo::default();
    let mut table_type = None;

    for (schema, col) in schemas.iter().zip(cols) {
        match schema.name.as_str() {
            "id" => table.object_id = read_u32_col(col)?,
            "name" => table.name = raw::read_utf16(col.buf).ok()?,
            "type" => table_type = col.buf.first().copied(),
            "intprop" => table.num_columns = read_u32_col(col)?,
            _ => {}
        }
    }

    (table.object_id != 0 && !table.name.is_empty() && table_type == Some(b'U')).then_some(table)
}

fn index_key_from_row(
    cols: &[ColumnSlice<'_>],
    schemas: &[ColumnSchema],
    object_id: u32,
) -> Option<(u16, u16)> {
    let mut idmajor = 0u32;
    let mut status = 0u32;
    let mut index_column_id = 0u32;
    let mut column_id = 0u32;

    for (schema, col) in schemas.iter().zip(cols) {
        match schema.name.as_str() {
            "idmajor" => idmajor = read_u32_col(col)?,
            "status" => status = read_u32_col(col)?,
            "subid" => index_column_id = read_u32_col(col)?,
            "intprop" => column_id = read_u32_col(col)?,
            _ => {}
        }
    }

    (idmajor == object_id && status & 2 != 0).then_some((index_column_id as u16, column_id as u16))
}

fn rowset_from_row(
    cols: &[ColumnSlice<'_>],
    schemas: &[ColumnSchema],
    object_id: u32,
) -> Option<u64> {
    let mut rowset_id = 0u64;
    let mut idmajor = 0u32;

    for (schema, col) in schemas.iter().zip(cols) {
        match schema.name.as_str() {
            "rowsetid" => rowset_id = read_u64_col(col)?,
            "idmajor" => idmajor = read_u32_col(col)?,
            _ => {}
        }
    }

    (idmajor == object_id && rowset_id != 0).then_some(rowset_id)
}

fn alloc_from_row(
    cols: &[ColumnSlice<'_>],
    schemas: &[ColumnSchema],
    partition_id: u64,
) -> Option<u64> {
    let mut owner_id = 0u64;
    let mut unit_type = 0u8;
    let mut auid = 0u64;

    for (schema, col) in schemas.iter().zip(cols) {
        match schema.name.as_str() {
            "ownerid" => owner_id = read_u64_col(col)?,
            "type" => unit_type = *col.buf.first()?,
            "auid" => auid = read_u64_col(col)?,
            _ => {}
        }
    }

    (owner_id != 0 && owner_id == partition_id && unit_type == 0x01 && auid != 0).then_some(auid)
}

/// Move the column at ordinal `old` to ordinal `new`, shifting the ordinals
/// in between by one.
pub(crate) fn change_ordinal(schemas: &mut [ColumnSchema], new: u16, old: u16) {
    let Some(moved) = schemas.iter().position(|s| s.ordinal == old) else {
        return;
    };

    for (i, schema) in schemas.iter_mut().enumerate() {
        if i == moved {
            continue;
        }
        if new < old && (new..old).contains(&schema.ordinal) {
            schema.ordinal += 1;
        } else if new > old && (old + 1..=new).contains(&schema.ordinal) {
            schema.ordinal -= 1;
        }
    }

    schemas[moved].ordinal = new;
}
