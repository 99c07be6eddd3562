use crate::common::*;
use std::collections::HashMap;

const REFERENCE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// One observation of the CSV index. `row` addresses the image and weather
/// arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub row: i64,
    pub identifier: String,
    pub position: String,
    #[serde(with = "reference_format")]
    pub reference: NaiveDateTime,
    pub path: PathBuf,
}

impl IndexRecord {
    /// File stem of the source image, used to name outputs.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("row-{}", self.row))
    }
}

/// Observations keyed by camera and reference time.
#[derive(Debug, Clone)]
pub struct ObservationIndex {
    records: Vec<IndexRecord>,
    lookup: HashMap<(String, String, NaiveDateTime), usize>,
}

impl ObservationIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let records: Vec<IndexRecord> = csv::Reader::from_path(path)
            .with_context(|| format!("unable to open {}", path.display()))?
            .deserialize()
            .try_collect()
            .with_context(|| format!("unable to parse {}", path.display()))?;
        info!("{} index records", records.len());
        Self::new(records)
    }

    pub fn new(records: Vec<IndexRecord>) -> Result<Self> {
        let mut lookup = HashMap::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            let key = (
                record.identifier.clone(),
                record.position.clone(),
                record.reference,
            );
            let prev = lookup.insert(key, index);
            ensure!(
                prev.is_none(),
                "duplicated observation {}/{} at {}",
                record.identifier,
                record.position,
                record.reference
            );
        }

        Ok(Self { records, lookup })
    }

    /// Keeps the records matching `predicate`.
    pub fn filter<F>(self, mut predicate: F) -> Result<Self>
    where
        F: FnMut(&IndexRecord) -> bool,
    {
        let records = self
            .records
            .into_iter()
            .filter(|record| predicate(record))
            .collect();
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// The observation of the same camera `minutes` after `source`.
    pub fn at_lead_time(
        &self,
        source: &IndexRecord,
        minutes: i64,
    ) -> Result<Option<&IndexRecord>> {
        let max_minutes = ChronoDuration::max_value().num_minutes();
        ensure!(
            (-max_minutes..=max_minutes).contains(&minutes),
            "lead time of {} minutes is out of range",
            minutes
        );
        let reference = source
            .reference
            .checked_add_signed(ChronoDuration::minutes(minutes))
            .ok_or_else(|| {
                format_err!(
                    "{} plus {} minutes is out of range",
                    source.reference,
                    minutes
                )
            })?;
        let key = (source.identifier.clone(), source.position.clone(), reference);
        Ok(self.lookup.get(&key).map(|&index| &self.records[index]))
    }
}

mod reference_format {
    use super::REFERENCE_FORMATS;
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(reference: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&reference.format(REFERENCE_FORMATS[0]).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        REFERENCE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(&text, format).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid reference time '{}'", text)))
    }
}
