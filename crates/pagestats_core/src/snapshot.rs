use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, ArrayRef, AsArray, GenericListArray, Int64Array, ListArray, OffsetSizeTrait,
    StringArray, StructArray,
};
use arrow::buffer::OffsetBuffer;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Fields, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A titled page and its lines in original order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub lines: Vec<Line>,
}

/// One line of a page. A null list entry in the snapshot decodes to a line
/// with every field unset so later positions keep their ordinals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Line {
    pub id: Option<String>,
    pub text: Option<String>,
    pub user_id: Option<String>,
    pub created: Option<i64>,
    pub updated: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub pages: usize,
    pub lines: usize,
    pub pages_without_lines: usize,
}

pub fn read_snapshot(path: &Path) -> Result<Vec<Page>> {
    let file =
        File::open(path).with_context(|| format!("failed to open snapshot {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata from {}", path.display()))?
        .build()
        .with_context(|| format!("failed to build parquet reader for {}", path.display()))?;

    let mut pages = Vec::new();
    for batch in reader {
        let batch = batch
            .with_context(|| format!("failed to read record batch from {}", path.display()))?;
        decode_batch(&batch, &mut pages)?;
    }
    Ok(pages)
}

pub fn summarize_pages(pages: &[Page]) -> SnapshotSummary {
    SnapshotSummary {
        pages: pages.len(),
        lines: pages.iter().map(|page| page.lines.len()).sum(),
        pages_without_lines: pages.iter().filter(|page| page.lines.is_empty()).count(),
    }
}

/// A handful of pages for offline use, shaped like the published corpus.
pub fn sample_pages() -> Vec<Page> {
    fn lines(author: &str, stamp: i64, texts: &[&str]) -> Vec<Line> {
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| Line {
                id: Some(format!("{author}-{stamp}-{index}")),
                text: Some((*text).to_string()),
                user_id: Some(author.to_string()),
                created: Some(stamp),
                updated: Some(stamp),
            })
            .collect()
    }

    vec![
        Page {
            id: "sample-0001".to_string(),
            title: "井戸端".to_string(),
            created: Some(1_577_836_800),
            updated: Some(1_706_731_200),
            lines: lines(
                "u1",
                1_577_836_800,
                &["井戸端", "ようこそ", "[雑談]はこちら", ""],
            ),
        },
        Page {
            id: "sample-0002".to_string(),
            title: "雑談".to_string(),
            created: Some(1_580_515_200),
            updated: Some(1_580_515_200),
            lines: lines("u2", 1_580_515_200, &["雑談", "今日は晴れ"]),
        },
        Page {
            id: "sample-0003".to_string(),
            title: "Weekly log".to_string(),
            created: Some(1_704_067_200),
            updated: Some(1_704_153_600),
            lines: lines(
                "u1",
                1_704_067_200,
                &["Weekly log", "- fixed the sidebar", "- wrote docs", "- reviewed #12"],
            ),
        },
        Page {
            id: "sample-0004".to_string(),
            title: "Empty draft".to_string(),
            created: Some(1_704_067_200),
            updated: Some(1_704_067_200),
            lines: Vec::new(),
        },
    ]
}

/// Hex SHA-256 of the snapshot file, for status output.
pub fn snapshot_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let digest = Sha256::digest(&bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

/// Write pages using the same layout the published snapshot uses.
pub fn write_snapshot(path: &Path, pages: &[Page]) -> Result<()> {
    let line_fields = Fields::from(vec![
        Field::new("id", DataType::Utf8, true),
        Field::new("text", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
        Field::new("created", DataType::Int64, true),
        Field::new("updated", DataType::Int64, true),
    ]);
    let item_field = Arc::new(Field::new(
        "item",
        DataType::Struct(line_fields.clone()),
        true,
    ));
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("created", DataType::Int64, true),
        Field::new("updated", DataType::Int64, true),
        Field::new("lines", DataType::List(item_field.clone()), false),
    ]));

    let all_lines: Vec<&Line> = pages.iter().flat_map(|page| page.lines.iter()).collect();
    let line_columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter(
            all_lines.iter().map(|line| line.id.as_deref()),
        )),
        Arc::new(StringArray::from_iter(
            all_lines.iter().map(|line| line.text.as_deref()),
        )),
        Arc::new(StringArray::from_iter(
            all_lines.iter().map(|line| line.user_id.as_deref()),
        )),
        Arc::new(Int64Array::from_iter(all_lines.iter().map(|line| line.created))),
        Arc::new(Int64Array::from_iter(all_lines.iter().map(|line| line.updated))),
    ];
    let line_struct = StructArray::try_new(line_fields, line_columns, None)
        .context("failed to assemble line struct array")?;
    let lines = ListArray::try_new(
        item_field,
        OffsetBuffer::from_lengths(pages.iter().map(|page| page.lines.len())),
        Arc::new(line_struct),
        None,
    )
    .context("failed to assemble lines list array")?;

    let page_columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            pages.iter().map(|page| page.id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            pages.iter().map(|page| page.title.as_str()),
        )),
        Arc::new(Int64Array::from_iter(pages.iter().map(|page| page.created))),
        Arc::new(Int64Array::from_iter(pages.iter().map(|page| page.updated))),
        Arc::new(lines),
    ];
    let batch = RecordBatch::try_new(schema.clone(), page_columns)
        .context("failed to assemble snapshot record batch")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))
        .context("failed to create parquet writer")?;
    writer
        .write(&batch)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("failed to finalize {}", path.display()))?;
    Ok(())
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<Page>) -> Result<()> {
    let ids = utf8_column(required_column(batch, "id")?, "id")?;
    let titles = utf8_column(required_column(batch, "title")?, "title")?;
    let created = int64_column(required_column(batch, "created")?, "created")?;
    let updated = int64_column(required_column(batch, "updated")?, "updated")?;
    let lines_column = required_column(batch, "lines")?;
    let lines = match lines_column.data_type() {
        DataType::List(_) => decode_lines(lines_column.as_list::<i32>())?,
        DataType::LargeList(_) => decode_lines(lines_column.as_list::<i64>())?,
        other => bail!("snapshot column `lines` must be a list of structs, found {other}"),
    };

    for (row, page_lines) in lines.into_iter().enumerate() {
        let Some(id) = optional_string(&ids, row) else {
            bail!("snapshot page at row {row} has no id");
        };
        let Some(title) = optional_string(&titles, row) else {
            bail!("snapshot page {id} has no title");
        };
        out.push(Page {
            id,
            title,
            created: optional_i64(&created, row),
            updated: optional_i64(&updated, row),
            lines: page_lines,
        });
    }
    Ok(())
}

fn decode_lines<O: OffsetSizeTrait>(list: &GenericListArray<O>) -> Result<Vec<Vec<Line>>> {
    let structs = list
        .values()
        .as_struct_opt()
        .context("snapshot column `lines` must contain structs")?;
    let ids = utf8_column(required_field(structs, "id")?, "lines.id")?;
    let texts = utf8_column(required_field(structs, "text")?, "lines.text")?;
    let users = utf8_column(required_field(structs, "userId")?, "lines.userId")?;
    let created = int64_column(required_field(structs, "created")?, "lines.created")?;
    let updated = int64_column(required_field(structs, "updated")?, "lines.updated")?;

    let offsets = list.value_offsets();
    let mut out = Vec::with_capacity(list.len());
    for row in 0..list.len() {
        if list.is_null(row) {
            out.push(Vec::new());
            continue;
        }
        let start = offsets[row].as_usize();
        let end = offsets[row + 1].as_usize();
        let mut lines = Vec::with_capacity(end - start);
        for index in start..end {
            if structs.is_null(index) {
                lines.push(Line::default());
                continue;
            }
            lines.push(Line {
                id: optional_string(&ids, index),
                text: optional_string(&texts, index),
                user_id: optional_string(&users, index),
                created: optional_i64(&created, index),
                updated: optional_i64(&updated, index),
            });
        }
        out.push(lines);
    }
    Ok(out)
}

fn required_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .with_context(|| format!("snapshot is missing required column `{name}`"))
}

fn required_field<'a>(structs: &'a StructArray, name: &str) -> Result<&'a ArrayRef> {
    structs
        .column_by_name(name)
        .with_context(|| format!("snapshot lines are missing required field `{name}`"))
}

fn utf8_column(array: &ArrayRef, name: &str) -> Result<StringArray> {
    let casted = cast(array, &DataType::Utf8).with_context(|| {
        format!(
            "snapshot column `{name}` has type {} which is not convertible to text",
            array.data_type()
        )
    })?;
    Ok(casted.as_string::<i32>().clone())
}

fn int64_column(array: &ArrayRef, name: &str) -> Result<Int64Array> {
    let casted = cast(array, &DataType::Int64).with_context(|| {
        format!(
            "snapshot column `{name}` has type {} which is not convertible to an integer",
            array.data_type()
        )
    })?;
    Ok(casted.as_primitive::<Int64Type>().clone())
}

fn optional_string(array: &StringArray, index: usize) -> Option<String> {
    if array.is_null(index) {
        None
    } else {
        Some(array.value(index).to_string())
    }
}

fn optional_i64(array: &Int64Array, index: usize) -> Option<i64> {
    if array.is_null(index) {
        None
    } else {
        Some(array.value(index))
    }
}
