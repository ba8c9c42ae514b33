use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use rusqlite::{Params, Row, params};
use serde::Serialize;
use tracing::debug;

use crate::session::{EXPANDED_ROW_COLUMNS, ExpandedRow, StatsSession};

/// Japan Standard Time has no daylight saving, so a fixed offset is exact.
pub const JST_OFFSET_SECONDS: i32 = 9 * 60 * 60;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageLength {
    pub page_id: String,
    pub title: String,
    pub url: String,
    pub total_char_count: i64,
    pub block_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalePage {
    pub page_id: String,
    pub title: String,
    pub url: String,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub block_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyCount {
    pub month: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CumulativeCount {
    pub month: String,
    pub cumulative_count: usize,
}

/// Pages per JST creation month. Pages whose creation time is missing or
/// outside the representable range are left out and counted in
/// `skipped_pages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreationTrend {
    pub months: Vec<MonthlyCount>,
    pub skipped_pages: usize,
}

impl CreationTrend {
    pub fn total_pages(&self) -> usize {
        self.months.iter().map(|month| month.count).sum()
    }
}

pub fn latest_update(session: &StatsSession) -> Result<Option<i64>> {
    session
        .connection()
        .query_row("SELECT MAX(updated) FROM expanded_lines", [], |row| {
            row.get(0)
        })
        .context("failed to query latest update")
}

pub fn total_page_count(session: &StatsSession) -> Result<usize> {
    let count: i64 = session
        .connection()
        .query_row(
            "SELECT COUNT(DISTINCT page_id) FROM expanded_lines",
            [],
            |row| row.get(0),
        )
        .context("failed to count pages")?;
    usize::try_from(count).context("page count does not fit into usize")
}

pub fn preview(session: &StatsSession, title: &str) -> Result<Vec<ExpandedRow>> {
    let sql = format!(
        "SELECT {EXPANDED_ROW_COLUMNS} FROM expanded_lines WHERE title = ?1 ORDER BY page_id ASC, line_no ASC"
    );
    query_rows(session, "preview", &sql, params![title], ExpandedRow::from_row)
}

pub fn longest_pages(
    session: &StatsSession,
    url_prefix: &str,
    limit: usize,
) -> Result<Vec<PageLength>> {
    let limit = i64::try_from(limit).context("limit does not fit into i64")?;
    query_rows(
        session,
        "longest_pages",
        "SELECT page_id,
                title,
                COALESCE(SUM(char_count), 0) AS total_char_count,
                group_concat(text, char(10) ORDER BY line_no) AS block_text
         FROM expanded_lines
         GROUP BY page_id, title
         ORDER BY total_char_count DESC, page_id ASC
         LIMIT ?1",
        params![limit],
        |row| {
            let title: String = row.get(1)?;
            let block_text: Option<String> = row.get(3)?;
            Ok(PageLength {
                page_id: row.get(0)?,
                url: page_url(url_prefix, &title),
                title,
                total_char_count: row.get(2)?,
                block_text: block_text.unwrap_or_default(),
            })
        },
    )
}

pub fn monthly_creation_trend(session: &StatsSession) -> Result<CreationTrend> {
    let created = query_rows(
        session,
        "page_creation",
        "SELECT page_id, MIN(created) FROM expanded_lines GROUP BY page_id",
        params![],
        |row| row.get::<_, Option<i64>>(1),
    )?;

    let mut by_month: BTreeMap<String, usize> = BTreeMap::new();
    let mut skipped_pages = 0usize;
    for epoch in created {
        match month_of(epoch) {
            Some(month) => *by_month.entry(month).or_insert(0) += 1,
            None => skipped_pages += 1,
        }
    }
    if skipped_pages > 0 {
        debug!(skipped_pages, "pages without a usable creation timestamp");
    }

    Ok(CreationTrend {
        months: by_month
            .into_iter()
            .map(|(month, count)| MonthlyCount { month, count })
            .collect(),
        skipped_pages,
    })
}

pub fn cumulative_page_counts(trend: &CreationTrend) -> Vec<CumulativeCount> {
    let mut running = 0usize;
    trend
        .months
        .iter()
        .map(|month| {
            running += month.count;
            CumulativeCount {
                month: month.month.clone(),
                cumulative_count: running,
            }
        })
        .collect()
}

pub fn stalest_pages(
    session: &StatsSession,
    url_prefix: &str,
    limit: usize,
) -> Result<Vec<StalePage>> {
    let limit = i64::try_from(limit).context("limit does not fit into i64")?;
    // NULL updates sort after every real timestamp.
    query_rows(
        session,
        "stalest_pages",
        "SELECT page_id,
                title,
                created,
                updated,
                group_concat(text, char(10) ORDER BY line_no) AS block_text
         FROM expanded_lines
         GROUP BY page_id, title, created, updated
         ORDER BY updated IS NULL, updated ASC, page_id ASC
         LIMIT ?1",
        params![limit],
        |row| {
            let title: String = row.get(1)?;
            let block_text: Option<String> = row.get(4)?;
            Ok(StalePage {
                page_id: row.get(0)?,
                url: page_url(url_prefix, &title),
                title,
                created: row.get(2)?,
                updated: row.get(3)?,
                block_text: block_text.unwrap_or_default(),
            })
        },
    )
}

pub fn page_url(url_prefix: &str, title: &str) -> String {
    format!("{url_prefix}{title}")
}

pub fn to_jst(epoch: Option<i64>) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(JST_OFFSET_SECONDS)?;
    DateTime::from_timestamp(epoch?, 0).map(|utc| utc.with_timezone(&offset))
}

pub fn format_jst(epoch: Option<i64>) -> Option<String> {
    to_jst(epoch).map(|time| time.format(TIMESTAMP_FORMAT).to_string())
}

/// `YYYY-MM` of the JST calendar month containing `epoch`.
pub fn month_of(epoch: Option<i64>) -> Option<String> {
    to_jst(epoch).map(|time| time.format("%Y-%m").to_string())
}

fn query_rows<T, P, F>(
    session: &StatsSession,
    name: &str,
    sql: &str,
    params: P,
    map: F,
) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let started = Instant::now();
    let mut statement = session
        .connection()
        .prepare(sql)
        .with_context(|| format!("failed to prepare {name} query"))?;
    let rows = statement
        .query_map(params, map)
        .with_context(|| format!("failed to run {name} query"))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("failed to decode {name} row"))?);
    }
    debug!(
        query = name,
        rows = out.len(),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "statistics query finished"
    );
    Ok(out)
}
