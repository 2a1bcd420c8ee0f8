use shared::domain::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
    Text,
    Bool,
    /// RFC 3339 text, normalised so that lexical order is chronological.
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnDefault {
    Required,
    Uuid,
    Now,
    True,
}

#[derive(Debug)]
pub(crate) struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub default: ColumnDefault,
}

#[derive(Debug)]
pub(crate) struct TableSchema {
    pub table: Table,
    pub columns: &'static [Column],
    /// Column holding the profile id that `embed_author` joins on.
    pub author_column: Option<&'static str>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|column| column.name == name)
    }
}

const fn col(name: &'static str, ty: ColumnType, default: ColumnDefault) -> Column {
    Column { name, ty, default }
}

static PROFILES: TableSchema = TableSchema {
    table: Table::Profiles,
    columns: &[
        col("id", ColumnType::Text, ColumnDefault::Uuid),
        col("username", ColumnType::Text, ColumnDefault::Required),
    ],
    author_column: None,
};

static SESSIONS: TableSchema = TableSchema {
    table: Table::Sessions,
    columns: &[
        col("id", ColumnType::Text, ColumnDefault::Uuid),
        col("name", ColumnType::Text, ColumnDefault::Required),
        col("created_by", ColumnType::Text, ColumnDefault::Required),
        col("created_at", ColumnType::Timestamp, ColumnDefault::Now),
        col("is_active", ColumnType::Bool, ColumnDefault::True),
    ],
    author_column: Some("created_by"),
};

static SESSION_PARTICIPANTS: TableSchema = TableSchema {
    table: Table::SessionParticipants,
    columns: &[
        col("id", ColumnType::Text, ColumnDefault::Uuid),
        col("session_id", ColumnType::Text, ColumnDefault::Required),
        col("profile_id", ColumnType::Text, ColumnDefault::Required),
        col("joined_at", ColumnType::Timestamp, ColumnDefault::Now),
    ],
    author_column: Some("profile_id"),
};

static MESSAGES: TableSchema = TableSchema {
    table: Table::Messages,
    columns: &[
        col("id", ColumnType::Text, ColumnDefault::Uuid),
        col("content", ColumnType::Text, ColumnDefault::Required),
        col("profile_id", ColumnType::Text, ColumnDefault::Required),
        col("session_id", ColumnType::Text, ColumnDefault::Required),
        col("created_at", ColumnType::Timestamp, ColumnDefault::Now),
    ],
    author_column: Some("profile_id"),
};

pub(crate) fn schema_for(table: Table) -> &'static TableSchema {
    match table {
        Table::Profiles => &PROFILES,
        Table::Sessions => &SESSIONS,
        Table::SessionParticipants => &SESSION_PARTICIPANTS,
        Table::Messages => &MESSAGES,
    }
}
