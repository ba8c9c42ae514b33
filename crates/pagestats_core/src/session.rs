use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use tracing::info;

use crate::snapshot::{Page, SnapshotSummary, read_snapshot, summarize_pages};

const EXPANDED_LINES_SQL: &str = r#"
CREATE TEMP TABLE expanded_lines (
    page_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created INTEGER,
    updated INTEGER,
    line_id TEXT,
    line_no INTEGER NOT NULL,
    line_created INTEGER,
    line_updated INTEGER,
    text TEXT,
    char_count INTEGER NOT NULL,
    line_user_id TEXT
);
CREATE INDEX idx_expanded_lines_page ON expanded_lines(page_id, line_no);
CREATE INDEX idx_expanded_lines_title ON expanded_lines(title);
"#;

pub(crate) const EXPANDED_ROW_COLUMNS: &str = "page_id, title, created, updated, line_id, line_no, line_created, line_updated, text, line_user_id";

/// One page/line pair of the `expanded_lines` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedRow {
    pub page_id: String,
    pub title: String,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub line_id: Option<String>,
    pub line_no: i64,
    pub line_created: Option<i64>,
    pub line_updated: Option<i64>,
    pub text: Option<String>,
    pub line_user_id: Option<String>,
}

impl ExpandedRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            page_id: row.get(0)?,
            title: row.get(1)?,
            created: row.get(2)?,
            updated: row.get(3)?,
            line_id: row.get(4)?,
            line_no: row.get(5)?,
            line_created: row.get(6)?,
            line_updated: row.get(7)?,
            text: row.get(8)?,
            line_user_id: row.get(9)?,
        })
    }
}

/// A SQLite session holding the `expanded_lines` relation for one snapshot.
/// Every statistics query borrows this handle; nothing mutates it after load.
pub struct StatsSession {
    connection: Connection,
    summary: SnapshotSummary,
}

impl StatsSession {
    pub fn open(snapshot_path: &Path) -> Result<Self> {
        let pages = read_snapshot(snapshot_path)?;
        let session = Self::from_pages(&pages)?;
        info!(
            path = %snapshot_path.display(),
            pages = session.summary.pages,
            lines = session.summary.lines,
            "loaded snapshot into expanded_lines"
        );
        Ok(session)
    }

    pub fn from_pages(pages: &[Page]) -> Result<Self> {
        let mut connection =
            Connection::open_in_memory().context("failed to open in-memory sqlite session")?;
        connection
            .execute_batch(EXPANDED_LINES_SQL)
            .context("failed to create expanded_lines")?;

        let transaction = connection
            .transaction()
            .context("failed to start expanded_lines load transaction")?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO expanded_lines (
                        page_id,
                        title,
                        created,
                        updated,
                        line_id,
                        line_no,
                        line_created,
                        line_updated,
                        text,
                        char_count,
                        line_user_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("failed to prepare expanded_lines insert")?;

            for page in pages {
                for (index, line) in page.lines.iter().enumerate() {
                    let line_no =
                        i64::try_from(index + 1).context("line ordinal does not fit into i64")?;
                    // SQLite LENGTH stops at the first NUL, so count in Rust.
                    let char_count = line
                        .text
                        .as_deref()
                        .map_or(0, |text| text.chars().count());
                    let char_count =
                        i64::try_from(char_count).context("line length does not fit into i64")?;
                    statement
                        .execute(params![
                            page.id,
                            page.title,
                            page.created,
                            page.updated,
                            line.id,
                            line_no,
                            line.created,
                            line.updated,
                            line.text,
                            char_count,
                            line.user_id,
                        ])
                        .with_context(|| format!("failed to expand lines of page {}", page.id))?;
                }
            }
        }
        transaction
            .commit()
            .context("failed to commit expanded_lines load transaction")?;

        Ok(Self {
            connection,
            summary: summarize_pages(pages),
        })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Page and line counts of the raw snapshot, including pages that have
    /// no lines and therefore no expanded rows.
    pub fn summary(&self) -> &SnapshotSummary {
        &self.summary
    }

    pub fn expanded_row_count(&self) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM expanded_lines", [], |row| row.get(0))
            .context("failed to count expanded_lines")?;
        usize::try_from(count).context("row count does not fit into usize")
    }

    /// The whole relation in `(page_id, line_no)` order.
    pub fn expanded_rows(&self) -> Result<Vec<ExpandedRow>> {
        let sql = format!(
            "SELECT {EXPANDED_ROW_COLUMNS} FROM expanded_lines ORDER BY page_id ASC, line_no ASC"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare expanded_lines scan")?;
        let rows = statement
            .query_map([], ExpandedRow::from_row)
            .context("failed to scan expanded_lines")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode expanded_lines row")?);
        }
        Ok(out)
    }
}

/// Builds the session for a snapshot path on first use and hands out the
/// same handle afterwards.
pub struct SessionCell {
    snapshot_path: PathBuf,
    session: OnceCell<StatsSession>,
}

impl SessionCell {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            session: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Result<&StatsSession> {
        if let Some(session) = self.session.get() {
            return Ok(session);
        }
        let session = StatsSession::open(&self.snapshot_path)?;
        Ok(self.session.get_or_init(|| session))
    }

    pub fn is_initialized(&self) -> bool {
        self.session.get().is_some()
    }
}
