use anyhow::Result;
use serde_json::{Map, Value, json};

use crate::config::StatsConfig;
use crate::session::{ExpandedRow, StatsSession};
use crate::stats::{
    CreationTrend, CumulativeCount, PageLength, StalePage, cumulative_page_counts, format_jst,
    latest_update, longest_pages, monthly_creation_trend, preview, stalest_pages,
    total_page_count,
};

pub const NULL_LABEL: &str = "<null>";
const MAX_TEXT_CELL_CHARS: usize = 60;
const CHART_WIDTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Text(String),
    Integer(i64),
    /// Epoch seconds, shown in JST. `None` renders as a labeled null.
    Timestamp(Option<i64>),
    Null,
}

impl Cell {
    fn optional_text(value: Option<&str>) -> Self {
        value.map_or(Self::Null, |value| Self::Text(value.to_string()))
    }

    fn count(value: usize) -> Self {
        i64::try_from(value).map_or(Self::Text(value.to_string()), Self::Integer)
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Text(value) => Value::String(value.clone()),
            Self::Integer(value) => json!(value),
            Self::Timestamp(epoch) => format_jst(*epoch).map_or(Value::Null, Value::String),
            Self::Null => Value::Null,
        }
    }

    fn to_text(&self, link: Option<&LinkColumn>) -> String {
        match self {
            Self::Text(value) => match link {
                Some(link) => link.display_text(value).to_string(),
                None => single_line(value),
            },
            Self::Integer(value) => value.to_string(),
            Self::Timestamp(epoch) => format_jst(*epoch).unwrap_or_else(|| NULL_LABEL.to_string()),
            Self::Null => NULL_LABEL.to_string(),
        }
    }
}

/// Render hint for a column holding page URLs: show the page part only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkColumn {
    pub field: String,
    pub label: String,
    pub help: String,
    pub strip_prefix: String,
}

impl LinkColumn {
    pub fn page_urls(strip_prefix: &str) -> Self {
        Self {
            field: "url".to_string(),
            label: "URL".to_string(),
            help: "The URL of the page".to_string(),
            strip_prefix: strip_prefix.to_string(),
        }
    }

    pub fn display_text<'a>(&self, url: &'a str) -> &'a str {
        url.strip_prefix(self.strip_prefix.as_str()).unwrap_or(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub link: Option<LinkColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Bar,
    Line,
}

impl ChartKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::Line => "line",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub title: String,
    pub kind: ChartKind,
    pub x_label: String,
    pub y_label: String,
    pub points: Vec<(String, usize)>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Widget {
    Table(Table),
    Chart(Chart),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dashboard {
    pub title: String,
    pub widgets: Vec<Widget>,
}

/// Run every statistic top to bottom against one session.
pub fn build_dashboard(
    session: &StatsSession,
    config: &StatsConfig,
    limit: usize,
) -> Result<Dashboard> {
    let prefix = config.page_url_prefix();
    let trend = monthly_creation_trend(session)?;
    let cumulative = cumulative_page_counts(&trend);

    Ok(Dashboard {
        title: format!("{} statistics", config.project_name()),
        widgets: vec![
            Widget::Table(latest_update_table(latest_update(session)?)),
            Widget::Table(page_count_table(total_page_count(session)?)),
            Widget::Table(preview_table(
                config.preview_title(),
                &preview(session, config.preview_title())?,
            )),
            Widget::Table(longest_pages_table(
                &longest_pages(session, &prefix, limit)?,
                &prefix,
                limit,
            )),
            Widget::Chart(monthly_trend_chart(&trend)),
            Widget::Chart(cumulative_chart(&cumulative)),
            Widget::Table(stalest_pages_table(
                &stalest_pages(session, &prefix, limit)?,
                &prefix,
                limit,
            )),
        ],
    })
}

pub fn latest_update_table(latest: Option<i64>) -> Table {
    Table {
        title: "Latest update".to_string(),
        columns: vec!["latest_update".to_string()],
        rows: vec![vec![Cell::Timestamp(latest)]],
        link: None,
    }
}

pub fn page_count_table(count: usize) -> Table {
    Table {
        title: "Total pages".to_string(),
        columns: vec!["page_count".to_string()],
        rows: vec![vec![Cell::count(count)]],
        link: None,
    }
}

pub fn preview_table(title: &str, rows: &[ExpandedRow]) -> Table {
    Table {
        title: format!("Data preview: {title}"),
        columns: [
            "page_id",
            "title",
            "created",
            "updated",
            "line_id",
            "line_no",
            "line_created",
            "line_updated",
            "text",
            "line_user_id",
        ]
        .iter()
        .map(|column| column.to_string())
        .collect(),
        rows: rows
            .iter()
            .map(|row| {
                vec![
                    Cell::Text(row.page_id.clone()),
                    Cell::Text(row.title.clone()),
                    Cell::Timestamp(row.created),
                    Cell::Timestamp(row.updated),
                    Cell::optional_text(row.line_id.as_deref()),
                    Cell::Integer(row.line_no),
                    Cell::Timestamp(row.line_created),
                    Cell::Timestamp(row.line_updated),
                    Cell::optional_text(row.text.as_deref()),
                    Cell::optional_text(row.line_user_id.as_deref()),
                ]
            })
            .collect(),
        link: None,
    }
}

pub fn longest_pages_table(pages: &[PageLength], url_prefix: &str, limit: usize) -> Table {
    Table {
        title: format!("Longest pages (top {limit})"),
        columns: vec![
            "url".to_string(),
            "total_char_count".to_string(),
            "block_text".to_string(),
        ],
        rows: pages
            .iter()
            .map(|page| {
                vec![
                    Cell::Text(page.url.clone()),
                    Cell::Integer(page.total_char_count),
                    Cell::Text(page.block_text.clone()),
                ]
            })
            .collect(),
        link: Some(LinkColumn::page_urls(url_prefix)),
    }
}

pub fn stalest_pages_table(pages: &[StalePage], url_prefix: &str, limit: usize) -> Table {
    Table {
        title: format!("Stalest pages (oldest update first, {limit})"),
        columns: vec![
            "url".to_string(),
            "created".to_string(),
            "updated".to_string(),
            "block_text".to_string(),
        ],
        rows: pages
            .iter()
            .map(|page| {
                vec![
                    Cell::Text(page.url.clone()),
                    Cell::Timestamp(page.created),
                    Cell::Timestamp(page.updated),
                    Cell::Text(page.block_text.clone()),
                ]
            })
            .collect(),
        link: Some(LinkColumn::page_urls(url_prefix)),
    }
}

pub fn monthly_trend_chart(trend: &CreationTrend) -> Chart {
    Chart {
        title: "Pages created per month".to_string(),
        kind: ChartKind::Bar,
        x_label: "month".to_string(),
        y_label: "count".to_string(),
        points: trend
            .months
            .iter()
            .map(|month| (month.month.clone(), month.count))
            .collect(),
        note: (trend.skipped_pages > 0).then(|| {
            format!(
                "{} page(s) without a creation timestamp are not charted",
                trend.skipped_pages
            )
        }),
    }
}

pub fn cumulative_chart(cumulative: &[CumulativeCount]) -> Chart {
    Chart {
        title: "Cumulative pages".to_string(),
        kind: ChartKind::Line,
        x_label: "month".to_string(),
        y_label: "cumulative_count".to_string(),
        points: cumulative
            .iter()
            .map(|row| (row.month.clone(), row.cumulative_count))
            .collect(),
        note: None,
    }
}

impl Table {
    pub fn render_text(&self) -> String {
        let mut out = format!("## {}\n", self.title);
        if self.rows.is_empty() {
            out.push_str("<no rows>\n");
            return out;
        }

        let headers: Vec<String> = self
            .columns
            .iter()
            .map(|column| match &self.link {
                Some(link) if &link.field == column => link.label.clone(),
                _ => column.clone(),
            })
            .collect();
        let rendered: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.columns)
                    .map(|(cell, column)| {
                        let link = self.link.as_ref().filter(|link| &link.field == column);
                        truncate_chars(&cell.to_text(link), MAX_TEXT_CELL_CHARS)
                    })
                    .collect()
            })
            .collect();

        let mut widths: Vec<usize> = headers.iter().map(|header| char_len(header)).collect();
        for row in &rendered {
            for (index, value) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(index) {
                    *width = (*width).max(char_len(value));
                }
            }
        }

        push_row(&mut out, &headers, &widths);
        let separator: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        push_row(&mut out, &separator, &widths);
        for row in &rendered {
            push_row(&mut out, row, &widths);
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut object = Map::new();
                for (column, cell) in self.columns.iter().zip(row) {
                    object.insert(column.clone(), cell.to_json());
                }
                Value::Object(object)
            })
            .collect();

        let mut out = json!({
            "kind": "table",
            "title": self.title,
            "columns": self.columns,
            "rows": rows,
        });
        if let (Some(link), Value::Object(object)) = (&self.link, &mut out) {
            let mut config = Map::new();
            config.insert(
                link.field.clone(),
                json!({
                    "type": "link",
                    "label": link.label,
                    "help": link.help,
                    "strip_prefix": link.strip_prefix,
                }),
            );
            object.insert("column_config".to_string(), Value::Object(config));
        }
        out
    }
}

impl Chart {
    pub fn render_text(&self) -> String {
        let mut out = format!("## {} ({} chart)\n", self.title, self.kind.as_str());
        if self.points.is_empty() {
            out.push_str("<no data>\n");
        } else {
            let max = self.points.iter().map(|(_, value)| *value).max().unwrap_or(0);
            let label_width = self
                .points
                .iter()
                .map(|(label, _)| char_len(label))
                .max()
                .unwrap_or(0)
                .max(char_len(&self.x_label));
            let value_width = self
                .points
                .iter()
                .map(|(_, value)| value.to_string().len())
                .max()
                .unwrap_or(0);
            for (label, value) in &self.points {
                let scaled = scale(*value, max, CHART_WIDTH);
                let mark = match self.kind {
                    ChartKind::Bar => "#".repeat(scaled),
                    ChartKind::Line => format!("{}*", " ".repeat(scaled.saturating_sub(1))),
                };
                out.push_str(&format!(
                    "{}  {:>value_width$}  {mark}\n",
                    pad(label, label_width),
                    value
                ));
            }
        }
        if let Some(note) = &self.note {
            out.push_str(&format!("note: {note}\n"));
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let points: Vec<Value> = self
            .points
            .iter()
            .map(|(label, value)| {
                let mut object = Map::new();
                object.insert(self.x_label.clone(), Value::String(label.clone()));
                object.insert(self.y_label.clone(), json!(value));
                Value::Object(object)
            })
            .collect();
        json!({
            "kind": format!("{}_chart", self.kind.as_str()),
            "title": self.title,
            "x": self.x_label,
            "y": self.y_label,
            "points": points,
            "note": self.note,
        })
    }
}

impl Widget {
    pub fn render_text(&self) -> String {
        match self {
            Self::Table(table) => table.render_text(),
            Self::Chart(chart) => chart.render_text(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Table(table) => table.to_json(),
            Self::Chart(chart) => chart.to_json(),
        }
    }
}

impl Dashboard {
    pub fn render_text(&self) -> String {
        let mut out = format!("# {}\n", self.title);
        for widget in &self.widgets {
            out.push('\n');
            out.push_str(&widget.render_text());
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let widgets: Vec<Value> = self.widgets.iter().map(Widget::to_json).collect();
        json!({
            "title": self.title,
            "widgets": widgets,
        })
    }
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| pad(cell, *width))
        .collect::<Vec<_>>()
        .join(" | ");
    out.push_str(line.trim_end());
    out.push('\n');
}

fn pad(value: &str, width: usize) -> String {
    let fill = width.saturating_sub(char_len(value));
    format!("{value}{}", " ".repeat(fill))
}

fn single_line(value: &str) -> String {
    value.replace('\n', " / ")
}

fn truncate_chars(value: &str, max: usize) -> String {
    if char_len(value) <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

fn scale(value: usize, max: usize, width: usize) -> usize {
    if max == 0 {
        return 0;
    }
    let scaled = value.saturating_mul(width) / max;
    if value > 0 { scaled.max(1) } else { 0 }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        Cell, ChartKind, LinkColumn, NULL_LABEL, Widget, build_dashboard, cumulative_chart,
        latest_update_table, longest_pages_table, monthly_trend_chart,
    };
    use crate::config::StatsConfig;
    use crate::session::StatsSession;
    use crate::snapshot::tests::page;
    use crate::stats::{CreationTrend, MonthlyCount, PageLength, cumulative_page_counts};

    const PREFIX: &str = "https://scrapbox.io/villagepump/";

    #[test]
    fn link_column_strips_prefix_for_display() {
        let link = LinkColumn::page_urls(PREFIX);
        assert_eq!(
            link.display_text("https://scrapbox.io/villagepump/井戸端"),
            "井戸端"
        );
        assert_eq!(
            link.display_text("https://elsewhere.example/x"),
            "https://elsewhere.example/x"
        );
    }

    #[test]
    fn longest_table_renders_display_text_and_json_keeps_url() {
        let table = longest_pages_table(
            &[PageLength {
                page_id: "a".to_string(),
                title: "Foo".to_string(),
                url: format!("{PREFIX}Foo"),
                total_char_count: 5,
                block_text: "ab\ncde".to_string(),
            }],
            PREFIX,
            100,
        );

        let text = table.render_text();
        assert!(text.contains("URL"));
        assert!(text.contains("Foo"));
        assert!(!text.contains(PREFIX));
        assert!(text.contains("ab / cde"));

        let value = table.to_json();
        assert_eq!(value["rows"][0]["url"], json!(format!("{PREFIX}Foo")));
        assert_eq!(value["rows"][0]["total_char_count"], json!(5));
        assert_eq!(value["rows"][0]["block_text"], json!("ab\ncde"));
        assert_eq!(value["column_config"]["url"]["strip_prefix"], json!(PREFIX));
    }

    #[test]
    fn null_timestamps_are_labeled() {
        let table = latest_update_table(None);
        assert!(table.render_text().contains(NULL_LABEL));
        assert_eq!(table.to_json()["rows"][0]["latest_update"], json!(null));

        let present = latest_update_table(Some(0));
        assert_eq!(
            present.to_json()["rows"][0]["latest_update"],
            json!("1970-01-01 09:00:00+09:00")
        );
        assert_eq!(Cell::Null.to_text(None), NULL_LABEL);
    }

    #[test]
    fn charts_render_points_in_order_and_mention_skipped_pages() {
        let trend = CreationTrend {
            months: vec![
                MonthlyCount {
                    month: "2024-01".to_string(),
                    count: 4,
                },
                MonthlyCount {
                    month: "2024-02".to_string(),
                    count: 2,
                },
            ],
            skipped_pages: 1,
        };
        let bars = monthly_trend_chart(&trend);
        assert_eq!(bars.kind, ChartKind::Bar);
        let text = bars.render_text();
        let january = text.find("2024-01").expect("january row");
        let february = text.find("2024-02").expect("february row");
        assert!(january < february);
        assert!(text.contains(&"#".repeat(40)));
        assert!(text.contains("1 page(s) without a creation timestamp"));

        let line = cumulative_chart(&cumulative_page_counts(&trend));
        let value = line.to_json();
        assert_eq!(value["kind"], json!("line_chart"));
        assert_eq!(value["points"][1]["cumulative_count"], json!(6));
    }

    #[test]
    fn dashboard_runs_every_statistic() {
        let session = StatsSession::from_pages(&[
            page("a", "Foo", 1_000, 2_000, &["ab", "cde"]),
            page("b", "井戸端", 500, 1_500, &["x"]),
        ])
        .expect("load session");

        let dashboard =
            build_dashboard(&session, &StatsConfig::default(), 100).expect("dashboard");
        assert_eq!(dashboard.widgets.len(), 7);
        match &dashboard.widgets[1] {
            Widget::Table(table) => assert_eq!(table.rows[0][0], Cell::Integer(2)),
            other => panic!("unexpected widget {other:?}"),
        }
        match &dashboard.widgets[2] {
            Widget::Table(table) => assert_eq!(table.rows.len(), 1),
            other => panic!("unexpected widget {other:?}"),
        }

        let text = dashboard.render_text();
        assert!(text.contains("## Longest pages (top 100)"));
        assert!(text.contains("## Cumulative pages (line chart)"));
        let json = dashboard.to_json();
        assert_eq!(json["widgets"].as_array().map(Vec::len), Some(7));
    }
}
