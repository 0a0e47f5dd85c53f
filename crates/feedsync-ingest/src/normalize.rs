//! Row normalization
//!
//! Turns a [`RawRow`] into a [`NormalizedRecord`]:
//!
//! 1. the unique key is copied from the key source column (blank → reject)
//! 2. fields declared numeric are stripped of whitespace and parsed; a
//!    failed parse nulls that field only
//! 3. NaN and infinities become null
//! 4. field names are trimmed, once per run when the normalizer is bound
//!    to the feed header
//! 5. the run watermark is stamped on the record
//!
//! A bound [`RecordNormalizer`] is immutable and can be shared across
//! threads.

use feedsync_common::types::{FieldValue, Watermark};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use crate::config::ReconcileConfig;
use crate::error::ValidationError;
use crate::models::{NormalizedRecord, RawRow};

/// Column roles for a run
#[derive(Debug, Clone)]
pub struct NormalizationSchema {
    pub key_source_column: String,
    pub key_field: String,
    pub numeric_fields: HashSet<String>,
}

impl NormalizationSchema {
    pub fn new(
        key_source_column: impl Into<String>,
        key_field: impl Into<String>,
        numeric_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key_source_column: key_source_column.into().trim().to_string(),
            key_field: key_field.into().trim().to_string(),
            numeric_fields: numeric_fields
                .into_iter()
                .map(|f| f.into().trim().to_string())
                .collect(),
        }
    }
}

impl From<&ReconcileConfig> for NormalizationSchema {
    fn from(config: &ReconcileConfig) -> Self {
        Self::new(
            config.key_source_column.as_str(),
            config.key_field.as_str(),
            config.numeric_fields.iter().map(String::as_str),
        )
    }
}

#[derive(Debug, Clone)]
struct ColumnSpec {
    name: String,
    numeric: bool,
}

/// Normalizer bound to one feed header
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    schema: NormalizationSchema,
    columns: HashMap<String, ColumnSpec>,
}

impl RecordNormalizer {
    /// Bind `schema` to the raw header names of a feed
    pub fn new(schema: NormalizationSchema, header: &[String]) -> Self {
        let columns = header
            .iter()
            .map(|raw| (raw.clone(), Self::spec_for(&schema, raw)))
            .collect();
        Self { schema, columns }
    }

    fn spec_for(schema: &NormalizationSchema, raw: &str) -> ColumnSpec {
        let name = raw.trim().to_string();
        let numeric = schema.numeric_fields.contains(&name);
        ColumnSpec { name, numeric }
    }

    fn column<'a>(&'a self, raw: &str) -> Cow<'a, ColumnSpec> {
        match self.columns.get(raw) {
            Some(spec) => Cow::Borrowed(spec),
            None => Cow::Owned(Self::spec_for(&self.schema, raw)),
        }
    }

    /// Normalize one row for the run stamped `watermark`
    pub fn normalize(
        &self,
        row: &RawRow,
        watermark: Watermark,
    ) -> Result<NormalizedRecord, ValidationError> {
        let key = self.derive_key(row)?;

        let mut fields = Vec::with_capacity(row.len() + 1);
        let mut nulled_fields = 0;

        for (raw_name, value) in row.iter() {
            let spec = self.column(raw_name);
            let value = match value {
                None => FieldValue::Null,
                Some(text) if spec.numeric => {
                    let coerced = coerce_number(text);
                    if coerced.is_null() {
                        nulled_fields += 1;
                    }
                    coerced
                },
                Some(text) => FieldValue::text(text),
            };

            // the key field is written below from the derived key
            if spec.name != self.schema.key_field {
                fields.push((spec.name.clone(), value));
            }
        }

        fields.push((self.schema.key_field.clone(), FieldValue::Text(key.clone())));

        Ok(NormalizedRecord {
            key,
            fields,
            watermark,
            nulled_fields,
        })
    }

    fn derive_key(&self, row: &RawRow) -> Result<String, ValidationError> {
        row.iter()
            .find(|(raw_name, _)| self.column(raw_name).name == self.schema.key_source_column)
            .and_then(|(_, value)| value)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ValidationError::MissingKey {
                line: row.line(),
                column: self.schema.key_source_column.clone(),
            })
    }
}

/// Parse a numeric cell; any failure yields [`FieldValue::Null`]
///
/// All whitespace is removed first, so `" 1 234.5 "` parses as `1234.5`.
/// Integer text is kept exact rather than rounded through a float.
pub fn coerce_number(text: &str) -> FieldValue {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    FieldValue::parse_number(&compact)
}
