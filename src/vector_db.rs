use std::collections::HashMap;

use anyhow::{Context, Result};
use qdrant_client::{
    qdrant::{
        value::Kind, Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
        Distance, FieldType, Filter, PointStruct, QueryPointsBuilder, UpsertPointsBuilder, Value,
        VectorParamsBuilder,
    },
    Qdrant,
};
use tracing::{debug, info};

use crate::schema::{InferredType, PropertyDescriptor};

/// Name of the payload field holding `{lat, lon}` coordinates.
pub const GEO_FIELD: &str = "geo_location";

/// Qdrant-backed provider collection.
///
/// The client is created once by the caller and passed to whatever needs it.
pub struct VectorStore {
    client: Qdrant,
}

impl VectorStore {
    pub fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Qdrant at {url}");
        let client = Qdrant::from_url(url)
            .build()
            .context("Failed to build Qdrant client. Is Qdrant running?")?;
        Ok(Self { client })
    }

    /// Creates `collection` unless it exists, with one payload index per
    /// property.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        properties: &[PropertyDescriptor],
        with_geo: bool,
    ) -> Result<()> {
        if self.client.collection_exists(collection).await? {
            info!("Collection '{collection}' already exists.");
            return Ok(());
        }

        info!("Collection '{collection}' does not exist. Creating...");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine)),
            )
            .await
            .with_context(|| format!("Failed to create collection '{collection}'"))?;

        let mut indexes: Vec<(&str, FieldType)> = properties
            .iter()
            .map(|p| (p.name.as_str(), field_type(p.ty)))
            .collect();
        if with_geo {
            indexes.push((GEO_FIELD, FieldType::Geo));
        }
        for (name, field_type) in indexes {
            debug!("Indexing payload field '{name}' as {field_type:?}");
            self.client
                .create_field_index(
                    CreateFieldIndexCollectionBuilder::new(collection, name, field_type).wait(true),
                )
                .await
                .with_context(|| format!("Failed to index field '{name}'"))?;
        }
        info!("Collection '{collection}' created.");
        Ok(())
    }

    pub async fn upsert(&self, collection: &str, points: Vec<PointStruct>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        debug!("Upserting {} points into '{collection}'", points.len());
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .context("Failed to upsert points")?;
        Ok(())
    }

    /// Returns the payloads of the `limit` nearest points passing `filter`.
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        filter: Option<Filter>,
        limit: u64,
    ) -> Result<Vec<HashMap<String, Value>>> {
        let mut query = QueryPointsBuilder::new(collection)
            .query(vector)
            .limit(limit)
            .with_payload(true);
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        let response = self
            .client
            .query(query)
            .await
            .with_context(|| format!("Failed to query collection '{collection}'"))?;
        Ok(response.result.into_iter().map(|p| p.payload).collect())
    }
}

/// Payload index type for a property.
pub fn field_type(ty: InferredType) -> FieldType {
    match ty {
        InferredType::Integer => FieldType::Integer,
        InferredType::Float => FieldType::Float,
        InferredType::Boolean => FieldType::Bool,
        InferredType::Text => FieldType::Keyword,
    }
}

/// Conjunction of exact matches; `None` when there is nothing to match.
pub fn match_all<'a, I>(conditions: I) -> Option<Filter>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let conditions: Vec<Condition> = conditions
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(field, value)| Condition::matches(field, value.to_string()))
        .collect();
    (!conditions.is_empty()).then(|| Filter::must(conditions))
}

/// Renders a payload value as plain text; absent and null values are empty.
pub fn payload_text(payload: &HashMap<String, Value>, field: &str) -> String {
    match payload.get(field).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        Some(Kind::IntegerValue(i)) => i.to_string(),
        Some(Kind::DoubleValue(d)) => d.to_string(),
        Some(Kind::BoolValue(b)) => b.to_string(),
        Some(_) | None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_types_follow_inferred_types() {
        assert_eq!(field_type(InferredType::Integer), FieldType::Integer);
        assert_eq!(field_type(InferredType::Float), FieldType::Float);
        assert_eq!(field_type(InferredType::Boolean), FieldType::Bool);
        assert_eq!(field_type(InferredType::Text), FieldType::Keyword);
    }

    #[test]
    fn empty_values_produce_no_filter() {
        assert!(match_all([("insurance_name", ""), ("specialization", "")]).is_none());
        assert!(match_all(std::iter::empty()).is_none());
    }

    #[test]
    fn filter_keeps_non_empty_conditions() {
        let filter = match_all([("insurance_name", "molina_healthcare"), ("specialization", "")])
            .unwrap();
        assert_eq!(filter.must.len(), 1);

        let filter = match_all([
            ("insurance_name", "molina_healthcare"),
            ("specialization", "cardiologist"),
        ])
        .unwrap();
        assert_eq!(filter.must.len(), 2);
        assert!(filter.should.is_empty());
    }

    #[test]
    fn payload_values_render_as_text() {
        let payload: HashMap<String, Value> = [
            ("city".to_string(), Value::from("Sacramento")),
            ("rating".to_string(), Value::from(4_i64)),
            ("accepting".to_string(), Value::from(true)),
        ]
        .into_iter()
        .collect();
        assert_eq!(payload_text(&payload, "city"), "Sacramento");
        assert_eq!(payload_text(&payload, "rating"), "4");
        assert_eq!(payload_text(&payload, "accepting"), "true");
        assert_eq!(payload_text(&payload, "missing"), "");
    }
}
