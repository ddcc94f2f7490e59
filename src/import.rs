use std::path::Path;

use anyhow::{bail, Context, Result};
use qdrant_client::{qdrant::PointStruct, Payload};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    llm::Assistant,
    schema::{open_csv, strip_separators, InferredType, PropertyDescriptor},
    settings::{ColumnMapping, ImportSettings, Settings},
    vector_db::{VectorStore, GEO_FIELD},
};

/// Where each stored property comes from in the CSV.
#[derive(Debug)]
struct Column {
    index: usize,
    property: PropertyDescriptor,
}

#[derive(Debug)]
struct GeoColumns {
    latitude: usize,
    longitude: usize,
}

/// Resolved layout of one CSV file against the collection properties.
#[derive(Debug)]
pub struct RecordLayout {
    columns: Vec<Column>,
    geo: Option<GeoColumns>,
    embed_fields: Vec<String>,
}

impl RecordLayout {
    /// Resolves mapped columns against `header`, typing each from `schema`.
    ///
    /// Columns the schema does not mention are stored as text.
    pub fn new(
        header: &[String],
        schema: &[PropertyDescriptor],
        settings: &ImportSettings,
    ) -> Result<Self> {
        let mapping: Vec<ColumnMapping> = if settings.columns.is_empty() {
            header
                .iter()
                .map(|name| ColumnMapping {
                    source: name.clone(),
                    target: name.clone(),
                })
                .collect()
        } else {
            settings.columns.clone()
        };

        let mut columns = Vec::with_capacity(mapping.len());
        for ColumnMapping { source, target } in mapping {
            let Some(index) = position(header, &source) else {
                bail!("Column '{source}' not found in CSV header");
            };
            let ty = schema
                .iter()
                .rev()
                .find(|p| p.name == source)
                .map_or(InferredType::Text, |p| p.ty);
            columns.push(Column {
                index,
                property: PropertyDescriptor::new(target, ty),
            });
        }

        let geo = match (
            non_empty(settings.latitude_column.as_deref()),
            non_empty(settings.longitude_column.as_deref()),
        ) {
            (Some(lat), Some(lon)) => match (position(header, lat), position(header, lon)) {
                (Some(latitude), Some(longitude)) => Some(GeoColumns {
                    latitude,
                    longitude,
                }),
                _ => {
                    warn!("Coordinate columns '{lat}'/'{lon}' not found; skipping {GEO_FIELD}");
                    None
                }
            },
            _ => None,
        };

        Ok(Self {
            columns,
            geo,
            embed_fields: settings.embed_fields.clone(),
        })
    }

    pub fn properties(&self) -> Vec<PropertyDescriptor> {
        self.columns.iter().map(|c| c.property.clone()).collect()
    }

    pub fn has_geo(&self) -> bool {
        self.geo.is_some()
    }

    /// Converts one CSV row into a JSON payload.
    pub fn payload(&self, row: &csv::StringRecord) -> Map<String, Value> {
        let mut payload = Map::new();
        for column in &self.columns {
            let raw = row.get(column.index).unwrap_or_default();
            payload.insert(column.property.name.clone(), coerce(raw, column.property.ty));
        }
        if let Some(geo) = &self.geo {
            let coordinates = row
                .get(geo.latitude)
                .and_then(parse_coordinate)
                .zip(row.get(geo.longitude).and_then(parse_coordinate));
            let (lat, lon) = coordinates.unwrap_or((0.0, 0.0));
            payload.insert(GEO_FIELD.to_string(), json!({ "lat": lat, "lon": lon }));
        }
        payload
    }

    /// Text that represents a payload in vector space.
    ///
    /// Falls back to every stored value when the configured fields are all
    /// blank. Empty only when the whole record is blank.
    pub fn embed_text(&self, payload: &Map<String, Value>) -> String {
        let text = join_values(self.embed_fields.iter().filter_map(|f| payload.get(f)));
        if text.is_empty() {
            join_values(
                self.columns
                    .iter()
                    .filter_map(|c| payload.get(&c.property.name)),
            )
        } else {
            text
        }
    }
}

fn join_values<'a>(values: impl Iterator<Item = &'a Value>) -> String {
    values
        .filter_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Null | Value::String(_) => None,
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(". ")
}

fn position(header: &[String], name: &str) -> Option<usize> {
    header.iter().position(|h| h == name)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Converts a raw cell to the JSON value for its column type.
///
/// Text cells are kept verbatim. Typed cells that are blank or fail to parse
/// become `null`.
pub fn coerce(raw: &str, ty: InferredType) -> Value {
    let value = raw.trim();
    if ty != InferredType::Text && value.is_empty() {
        return Value::Null;
    }
    match ty {
        InferredType::Text => Value::String(raw.to_string()),
        InferredType::Integer => {
            let digits = strip_separators(value);
            match digits.parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => float_value(&digits),
            }
        }
        InferredType::Float => float_value(&strip_separators(value)),
        InferredType::Boolean => {
            if value.eq_ignore_ascii_case("true") {
                Value::Bool(true)
            } else if value.eq_ignore_ascii_case("false") {
                Value::Bool(false)
            } else {
                Value::Null
            }
        }
    }
}

fn float_value(value: &str) -> Value {
    value
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

/// Stable point id for row `row` of the file at `source`.
///
/// Re-importing a file replaces its own points; other files get distinct ids.
pub fn point_id(source: &Path, row: usize) -> String {
    let name = format!("{}#{row}", source.display());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// A record waiting to be embedded.
#[derive(Debug)]
struct PendingPoint {
    id: String,
    text: String,
    payload: Map<String, Value>,
}

/// Groups items into batches of a fixed size; the last one may be shorter.
#[derive(Debug)]
struct Batcher<T> {
    size: usize,
    pending: Vec<T>,
}

impl<T> Batcher<T> {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            pending: Vec::with_capacity(size),
        }
    }

    /// Adds `item`, handing back a full batch once `size` items are pending.
    fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.pending.push(item);
        (self.pending.len() >= self.size)
            .then(|| std::mem::replace(&mut self.pending, Vec::with_capacity(self.size)))
    }

    /// Remaining items, if any.
    fn finish(self) -> Option<Vec<T>> {
        (!self.pending.is_empty()).then_some(self.pending)
    }
}

fn into_points(batch: Vec<PendingPoint>, vectors: Vec<Vec<f32>>) -> Result<Vec<PointStruct>> {
    batch
        .into_iter()
        .zip(vectors)
        .map(|(pending, vector)| {
            let payload = Payload::try_from(Value::Object(pending.payload))?;
            Ok(PointStruct::new(pending.id, vector, payload))
        })
        .collect()
}

async fn flush(
    assistant: &Assistant,
    store: &VectorStore,
    collection: &str,
    batch: Vec<PendingPoint>,
) -> Result<()> {
    let texts = batch.iter().map(|p| p.text.clone()).collect();
    let vectors = assistant.embed(texts).await?;
    store.upsert(collection, into_points(batch, vectors)?).await
}

/// Loads every row of `csv_path` into the configured collection.
///
/// The collection and its payload indexes are created first when missing.
/// Returns the number of imported records.
pub async fn import_csv(
    store: &VectorStore,
    assistant: &Assistant,
    settings: &Settings,
    csv_path: &Path,
    schema: &[PropertyDescriptor],
) -> Result<u64> {
    let import = &settings.import;
    let collection = settings.qdrant.collection.as_str();
    let mut reader = open_csv(csv_path)?;
    let header: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(str::to_owned)
        .collect();
    let layout = RecordLayout::new(&header, schema, import)?;

    store
        .ensure_collection(
            collection,
            settings.qdrant.vector_size,
            &layout.properties(),
            layout.has_geo(),
        )
        .await?;

    info!("Importing records from {}", csv_path.display());
    let source = std::fs::canonicalize(csv_path).unwrap_or_else(|_| csv_path.to_path_buf());
    let interval = import.progress_interval.max(1) as u64;
    let mut batcher = Batcher::new(import.batch_size);
    let mut counter = 0_u64;

    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to parse CSV row {}", index + 1))?;
        let payload = layout.payload(&record);
        let text = layout.embed_text(&payload);
        if text.is_empty() {
            warn!("Skipping blank CSV row {}", index + 1);
            continue;
        }
        let pending = PendingPoint {
            id: point_id(&source, index),
            text,
            payload,
        };

        counter += 1;
        if counter % interval == 0 {
            info!("Imported {counter} records...");
        }
        if let Some(batch) = batcher.push(pending) {
            flush(assistant, store, collection, batch).await?;
        }
    }
    if let Some(batch) = batcher.finish() {
        flush(assistant, store, collection, batch).await?;
    }

    info!("Import completed. Total records imported: {counter}");
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import_settings(columns: Vec<ColumnMapping>) -> ImportSettings {
        ImportSettings {
            batch_size: 2,
            progress_interval: 1,
            latitude_column: Some("Latitude".to_string()),
            longitude_column: Some("Longitude".to_string()),
            embed_fields: vec!["specialization".to_string(), "search_tags".to_string()],
            columns,
        }
    }

    fn mapping(source: &str, target: &str) -> ColumnMapping {
        ColumnMapping {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn header() -> Vec<String> {
        ["Provider First Name", "pri_spec", "Years", "Latitude", "Longitude", "terms"]
            .iter()
            .map(|h| (*h).to_string())
            .collect()
    }

    fn schema() -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::new("Provider First Name", InferredType::Text),
            PropertyDescriptor::new("pri_spec", InferredType::Text),
            PropertyDescriptor::new("Years", InferredType::Integer),
            PropertyDescriptor::new("Latitude", InferredType::Float),
            PropertyDescriptor::new("Longitude", InferredType::Float),
            PropertyDescriptor::new("terms", InferredType::Text),
        ]
    }

    #[test]
    fn coerce_by_type() {
        assert_eq!(coerce("42", InferredType::Integer), json!(42));
        assert_eq!(coerce("1_000", InferredType::Integer), json!(1000));
        assert_eq!(coerce("2.5", InferredType::Float), json!(2.5));
        assert_eq!(coerce("TRUE", InferredType::Boolean), json!(true));
        assert_eq!(coerce(" Ann ", InferredType::Text), json!(" Ann "));
    }

    #[test]
    fn coerce_blank_or_invalid() {
        assert_eq!(coerce("", InferredType::Text), json!(""));
        assert_eq!(coerce("  ", InferredType::Integer), Value::Null);
        assert_eq!(coerce("abc", InferredType::Float), Value::Null);
        assert_eq!(coerce("nan", InferredType::Float), Value::Null);
        assert_eq!(coerce("yes", InferredType::Boolean), Value::Null);
    }

    #[test]
    fn oversized_integers_fall_back_to_float() {
        assert_eq!(
            coerce("100000000000000000000", InferredType::Integer),
            json!(1e20)
        );
    }

    #[test]
    fn layout_maps_and_types_columns() {
        let settings = import_settings(vec![
            mapping("Provider First Name", "first_name"),
            mapping("Years", "years"),
            mapping("Unknown", "unknown_in_schema"),
        ]);
        let mut header = header();
        header.push("Unknown".to_string());
        let layout = RecordLayout::new(&header, &schema(), &settings).unwrap();
        assert_eq!(
            layout.properties(),
            vec![
                PropertyDescriptor::new("first_name", InferredType::Text),
                PropertyDescriptor::new("years", InferredType::Integer),
                PropertyDescriptor::new("unknown_in_schema", InferredType::Text),
            ]
        );
        assert!(layout.has_geo());
    }

    #[test]
    fn layout_rejects_missing_column() {
        let settings = import_settings(vec![mapping("Managed Care Plan", "insurance_name")]);
        assert!(RecordLayout::new(&header(), &schema(), &settings).is_err());
    }

    #[test]
    fn empty_mapping_keeps_header_names() {
        let mut settings = import_settings(Vec::new());
        settings.latitude_column = None;
        let layout = RecordLayout::new(&header(), &schema(), &settings).unwrap();
        let names: Vec<String> = layout.properties().into_iter().map(|p| p.name).collect();
        assert_eq!(names, header());
        assert!(!layout.has_geo());
    }

    #[test]
    fn payload_from_row() {
        let settings = import_settings(vec![
            mapping("Provider First Name", "first_name"),
            mapping("pri_spec", "specialization"),
            mapping("Years", "years"),
            mapping("terms", "search_tags"),
        ]);
        let layout = RecordLayout::new(&header(), &schema(), &settings).unwrap();

        let row = csv::StringRecord::from(vec!["Ann", "cardiologist", "12", "38.58", "-121.49", "heart"]);
        let payload = layout.payload(&row);
        assert_eq!(
            Value::Object(payload.clone()),
            json!({
                "first_name": "Ann",
                "specialization": "cardiologist",
                "years": 12,
                "search_tags": "heart",
                "geo_location": { "lat": 38.58, "lon": -121.49 },
            })
        );
        assert_eq!(layout.embed_text(&payload), "cardiologist. heart");
    }

    #[test]
    fn short_row_and_bad_coordinates() {
        let settings = import_settings(vec![
            mapping("Provider First Name", "first_name"),
            mapping("Years", "years"),
            mapping("terms", "search_tags"),
        ]);
        let layout = RecordLayout::new(&header(), &schema(), &settings).unwrap();

        let row = csv::StringRecord::from(vec!["Bob", "", "", "n/a"]);
        let payload = layout.payload(&row);
        assert_eq!(payload["first_name"], json!("Bob"));
        assert_eq!(payload["years"], Value::Null);
        assert_eq!(payload["search_tags"], json!(""));
        assert_eq!(payload[GEO_FIELD], json!({ "lat": 0.0, "lon": 0.0 }));
        assert_eq!(layout.embed_text(&payload), "Bob");
    }

    #[test]
    fn blank_row_has_no_embed_text() {
        let settings = import_settings(vec![
            mapping("Provider First Name", "first_name"),
            mapping("Years", "years"),
        ]);
        let layout = RecordLayout::new(&header(), &schema(), &settings).unwrap();
        let payload = layout.payload(&csv::StringRecord::from(vec!["", "", " "]));
        assert_eq!(layout.embed_text(&payload), "");
    }

    #[test]
    fn point_ids_are_stable_per_file_and_row() {
        let a = Path::new("/data/a.csv");
        let b = Path::new("/data/b.csv");
        assert_eq!(point_id(a, 0), point_id(a, 0));
        assert_ne!(point_id(a, 0), point_id(a, 1));
        assert_ne!(point_id(a, 0), point_id(b, 0));
        assert!(Uuid::parse_str(&point_id(b, 7)).is_ok());
    }

    #[test]
    fn batches_of_exact_multiple() {
        let mut batcher = Batcher::new(2);
        let full: Vec<Vec<u32>> = (1..=4).filter_map(|i| batcher.push(i)).collect();
        assert_eq!(full, [vec![1, 2], vec![3, 4]]);
        assert_eq!(batcher.finish(), None);
    }

    #[test]
    fn batches_with_remainder() {
        let mut batcher = Batcher::new(2);
        let full: Vec<Vec<u32>> = (1..=5).filter_map(|i| batcher.push(i)).collect();
        assert_eq!(full, [vec![1, 2], vec![3, 4]]);
        assert_eq!(batcher.finish(), Some(vec![5]));
    }

    #[test]
    fn zero_batch_size_flushes_every_item() {
        let mut batcher = Batcher::new(0);
        assert_eq!(batcher.push("a"), Some(vec!["a"]));
        assert_eq!(batcher.finish(), None);
    }

    #[test]
    fn points_pair_ids_with_vectors() {
        let batch = vec![
            PendingPoint {
                id: point_id(Path::new("a.csv"), 0),
                text: "cardiologist".to_string(),
                payload: Map::new(),
            },
            PendingPoint {
                id: point_id(Path::new("a.csv"), 1),
                text: "dentist".to_string(),
                payload: Map::new(),
            },
        ];
        let points = into_points(batch, vec![vec![0.1, 0.2], vec![0.3, 0.4]]).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].id.is_some());
    }
}
