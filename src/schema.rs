/// Physical storage class of a column inside a row record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Static,
    Variable,
}

/// SQL Server column types, mapped from the catalog's `xtype` byte
/// (disambiguated by `utype` where one `xtype` is shared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Bit,
    Date,
    DateTime,
    DateTime2,
    DateTimeOffset,
    Decimal,
    Numeric,
    HierarchyId,
    Geometry,
    Geography,
    Int,
    SmallInt,
    TinyInt,
    Char,
    NChar,
    VarChar,
    NVarChar,
    Sysname,
    Binary,
    VarBinary,
    Real,
    Float,
    Money,
    SmallMoney,
    SmallDateTime,
    Time,
    Timestamp,
    UniqueIdentifier,
    SqlVariant,
    Xml,
    Text,
    NText,
    Image,
    Unknown,
}

impl SqlType {
    pub fn from_xtype(xtype: u8, utype: u32) -> SqlType {
        use SqlType::*;

        match xtype {
            0x22 => Image,
            0x23 => Text,
            0x24 => UniqueIdentifier,
            0x28 => Date,
            0x29 => Time,
            0x2A => DateTime2,
            0x2B => DateTimeOffset,
            0x30 => TinyInt,
            0x34 => SmallInt,
            0x38 => Int,
            0x3A => SmallDateTime,
            0x3B => Real,
            0x3C => Money,
            0x3D => DateTime,
            0x3E => Float,
            0x62 => SqlVariant,
            0x63 => NText,
            0x68 => Bit,
            0x6A => Decimal,
            0x6C => Numeric,
            0x7A => SmallMoney,
            0x7F => BigInt,
            0xA5 => VarBinary,
            0xA7 => VarChar,
            0xAD => Binary,
            0xAF => Char,
            0xBD => Timestamp,
            0xE7 => match utype {
                0xE7 => NVarChar,
                0x100 => Sysname,
                _ => Unknown,
            },
            0xEF => NChar,
            0xF0 => match utype {
                0x80 => HierarchyId,
                0x81 => Geometry,
                0x82 => Geography,
                _ => Unknown,
            },
            0xF1 => Xml,
            _ => Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        use SqlType::*;

        match self {
            BigInt => "bigint",
            Bit => "bit",
            Date => "date",
            DateTime => "datetime",
            DateTime2 => "datetime2",
            DateTimeOffset => "datetimeoffset",
            Decimal => "decimal",
            Numeric => "numeric",
            HierarchyId => "hierarchyid",
            Geometry => "geometry",
            Geography => "geography",
            Int => "int",
            SmallInt => "smallint",
            TinyInt => "tinyint",
            Char => "char",
            NChar => "nchar",
            VarChar => "varchar",
            NVarChar => "nvarchar",
            Sysname => "sysname",
            Binary => "binary",
            VarBinary => "varbinary",
            Real => "real",
            Float => "float",
            Money => "money",
            SmallMoney => "smallmoney",
            SmallDateTime => "smalldatetime",
            Time => "time",
            Timestamp => "timestamp",
            UniqueIdentifier => "uniqueidentifier",
            SqlVariant => "sql_variant",
            Xml => "xml",
            Text => "text",
            NText => "ntext",
            Image => "image",
            Unknown => "unknown",
        }
    }

    /// Storage class, or `None` for types the row decoder does not place
    /// (they decode to an empty literal and consume no row bytes).
    pub fn kind(&self) -> Option<ColumnKind> {
        use SqlType::*;

        match self {
            BigInt | Date | Geography | Geometry | Real | Int | Float | Char | NChar | Binary
            | TinyInt | SmallInt | Money | SmallMoney | UniqueIdentifier | Numeric | Decimal
            | DateTime | SmallDateTime | Time | DateTime2 | DateTimeOffset | Timestamp | Bit => {
                Some(ColumnKind::Static)
            }
            VarChar | NVarChar | VarBinary | HierarchyId | SqlVariant | Xml | Sysname | Text
            | Image | NText => Some(ColumnKind::Variable),
            Unknown => None,
        }
    }

    /// Off-row types whose presence disables the trailing-column check.
    pub fn is_lob_only(&self) -> bool {
        matches!(self, SqlType::Text | SqlType::Image | SqlType::NText)
    }

    pub fn has_numeric_precision(&self) -> bool {
        matches!(self, SqlType::Numeric | SqlType::Decimal)
    }

    pub fn has_time_scale(&self) -> bool {
        matches!(self, SqlType::Time | SqlType::DateTime2 | SqlType::DateTimeOffset)
    }
}

/// One column of a system or user table, as read from `syscolpars`.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub object_id: u32,
    pub ordinal: u16,
    pub xtype: u8,
    pub utype: u32,
    pub col_size: u16,
    pub name: String,
    pub ty: SqlType,
    pub is_max: bool,
    pub precision: u8,
    pub scale: u8,
}

impl ColumnSchema {
    /// Declared type text as it appears in emitted CAST/CONVERT expressions,
    /// e.g. `numeric(10, 2)` or `datetime2(7)`.
    pub fn declared_type(&self) -> String {
        if self.ty.has_numeric_precision() {
            format!("{}({}, {})", self.ty.name(), self.precision, self.scale)
        } else if self.ty.has_time_scale() {
            format!("{}({})", self.ty.name(), self.scale)
        } else {
            self.ty.name().to_string()
        }
    }
}

/// Physical row layout derived from a table's column schemas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLayout {
    pub total_cols: usize,
    pub static_cols: usize,
    pub variable_cols: usize,
    pub bit_cols: usize,
    pub static_length: usize,
    pub check_last_column: bool,
}

impl RowLayout {
    /// Derive the layout from schemas sorted by ordinal.
    pub fn analyze(schemas: &[ColumnSchema]) -> RowLayout {
        let mut layout = RowLayout::default();
        for schema in schemas {
            layout.add(schema);
        }
        layout
    }

    fn add(&mut self, schema: &ColumnSchema) {
        match schema.ty.kind() {
            Some(ColumnKind::Static) if schema.ty == SqlType::Bit => {
                // eight bit columns share one static byte
                if self.bit_cols % 8 == 0 {
                    self.static_length += 1;
                }
                self.static_cols += 1;
                self.bit_cols += 1;
            }
            Some(ColumnKind::Static) => {
                self.static_cols += 1;
                self.static_length += schema.col_size as usize;
            }
            Some(ColumnKind::Variable) => {
                self.variable_cols += 1;
                self.check_last_column = !schema.ty.is_lob_only();
            }
            None => {}
        }

        self.total_cols = schema.ordinal as usize;
    }
}

/// One user table with its physical identity resolved from the catalog.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub object_id: u32,
    pub name: String,
    pub num_columns: u32,
    pub pobject_id: u64,
    pub partition_id: u64,
}
