use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Primitive type of a column, as inferred from its values.
///
/// There is no date variant; dates are inferred as `Text`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InferredType {
    Boolean,
    Integer,
    Float,
    Text,
}

impl fmt::Display for InferredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InferredType::Integer => "Integer",
            InferredType::Float => "Float",
            InferredType::Boolean => "Boolean",
            InferredType::Text => "Text",
        };
        write!(f, "{s}")
    }
}

/// One collection property: a column name and its inferred type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "data_type")]
    pub ty: InferredType,
    #[serde(default = "enabled")]
    pub vectorize_property_name: bool,
    #[serde(default = "enabled")]
    pub skip_vectorization: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, ty: InferredType) -> Self {
        Self {
            name: name.into(),
            ty,
            vectorize_property_name: true,
            skip_vectorization: true,
        }
    }
}

fn enabled() -> bool {
    true
}

/// A delimited table held fully in memory.
#[derive(Debug, Default)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Classifies a single non-blank value.
fn classify(value: &str) -> InferredType {
    if is_integer_literal(value) {
        InferredType::Integer
    } else if is_float_literal(value) {
        InferredType::Float
    } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        InferredType::Boolean
    } else {
        InferredType::Text
    }
}

/// Infers the type of a column from its raw values.
///
/// Blank values carry no evidence. A single observed tag is returned as is;
/// otherwise any text forces `Text`, then `Float` beats `Integer`. A column
/// with no evidence at all is `Text`.
pub fn infer_column_type<I, S>(values: I) -> InferredType
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let observed: BTreeSet<InferredType> = values
        .into_iter()
        .filter_map(|value| {
            let value = value.as_ref().trim();
            (!value.is_empty()).then(|| classify(value))
        })
        .collect();

    if observed.len() == 1 {
        return observed.into_iter().next().unwrap_or(InferredType::Text);
    }
    if observed.contains(&InferredType::Text) {
        InferredType::Text
    } else if observed.contains(&InferredType::Float) {
        InferredType::Float
    } else if observed.contains(&InferredType::Integer) {
        InferredType::Integer
    } else {
        InferredType::Text
    }
}

/// Builds one descriptor per header entry, in header order.
///
/// Rows shorter than the header contribute nothing to the missing columns and
/// cells past the header length are ignored. Evidence is keyed by column name,
/// so repeated header names share whatever the last matching cell wrote.
pub fn build_schema<H, R>(header: &[H], rows: &[R]) -> Vec<PropertyDescriptor>
where
    H: AsRef<str>,
    R: AsRef<[String]>,
{
    let mut columns: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in rows {
        for (name, value) in header.iter().zip(row.as_ref()) {
            columns
                .entry(name.as_ref())
                .or_default()
                .push(value.as_str());
        }
    }

    header
        .iter()
        .map(|name| {
            let name = name.as_ref();
            let values = columns.get(name).map(Vec::as_slice).unwrap_or_default();
            let ty = infer_column_type(values);
            debug!("Column '{name}' inferred as {ty} from {} values", values.len());
            PropertyDescriptor::new(name, ty)
        })
        .collect()
}

/// Input with any leading UTF-8 byte-order mark removed.
pub type BomStripped<R> = io::Chain<io::Cursor<Vec<u8>>, R>;

/// Wraps `reader` so that a leading UTF-8 byte-order mark is skipped.
///
/// Reads until three bytes are available, however the reader splits them.
pub fn skip_bom<R: Read>(mut reader: R) -> io::Result<BomStripped<R>> {
    let mut prefix = [0_u8; BOM.len()];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let head = if prefix[..filled] == *BOM {
        Vec::new()
    } else {
        prefix[..filled].to_vec()
    };
    Ok(io::Cursor::new(head).chain(reader))
}

/// Comma-separated reader over `reader`, tolerating ragged rows.
pub fn csv_reader<R: Read>(reader: R) -> io::Result<csv::Reader<BomStripped<R>>> {
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(skip_bom(reader)?))
}

pub fn open_csv(path: &Path) -> Result<csv::Reader<BomStripped<File>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    csv_reader(file).with_context(|| format!("Failed to read {}", path.display()))
}

/// Reads a header and all data rows from comma-separated input.
pub fn read_table<R: Read>(reader: R) -> Result<Table> {
    let mut reader = csv_reader(reader).context("Failed to read CSV input")?;
    let header = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(str::to_owned)
        .collect();
    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to parse CSV row {}", index + 1))?;
        rows.push(record.iter().map(str::to_owned).collect());
    }
    Ok(Table { header, rows })
}

pub fn read_table_from_path(path: &Path) -> Result<Table> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    read_table(file).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_schema_file(path: &Path, properties: &[PropertyDescriptor]) -> Result<()> {
    let json = serde_json::to_string_pretty(properties)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write schema file: {}", path.display()))
}

pub fn read_schema_file(path: &Path) -> Result<Vec<PropertyDescriptor>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("Invalid schema file: {}", path.display()))
}

/// Infers the schema of `csv_path` and writes it to `schema_path`.
pub fn generate_schema(csv_path: &Path, schema_path: &Path) -> Result<Vec<PropertyDescriptor>> {
    let table = read_table_from_path(csv_path)?;
    let properties = build_schema(&table.header, &table.rows);
    write_schema_file(schema_path, &properties)?;
    info!(
        "File '{}' has been created with {} inferred properties.",
        schema_path.display(),
        properties.len()
    );
    Ok(properties)
}

/// Base-10 integer: optional sign, digits, `_` allowed between digits.
fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit() || b == b'_')
        && underscores_between_digits(digits)
}

fn is_float_literal(s: &str) -> bool {
    if !s.contains('_') {
        return s.parse::<f64>().is_ok();
    }
    underscores_between_digits(s) && s.replace('_', "").parse::<f64>().is_ok()
}

fn underscores_between_digits(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().all(|(i, &b)| {
        b != b'_'
            || (i > 0
                && bytes[i - 1].is_ascii_digit()
                && bytes.get(i + 1).is_some_and(u8::is_ascii_digit))
    })
}

/// Removes `_` digit separators so the value can be handed to `str::parse`.
pub(crate) fn strip_separators(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains('_') {
        value.replace('_', "").into()
    } else {
        value.into()
    }
}
