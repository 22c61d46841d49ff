use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::dataset::{ArrayData, Attributes, DType, Dataset, Variable, default_fill};
use crate::domain::SourceLocation;
use crate::error::IngestError;
use crate::storage::{self, Backends};

pub trait SourceReader: Send + Sync {
    fn open(&self, location: &SourceLocation) -> Result<Dataset, IngestError>;
}

/// On-disk JSON form of a dataset. `null` array entries stand for the
/// variable's fill value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetDocument {
    #[serde(default)]
    pub attrs: Attributes,
    #[serde(default)]
    pub coords: BTreeMap<String, VariableDocument>,
    #[serde(default)]
    pub data_vars: BTreeMap<String, VariableDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDocument {
    pub dims: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    pub dtype: DType,
    pub data: Vec<Option<f64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub encoding: Attributes,
}

impl VariableDocument {
    fn into_variable(self) -> Result<Variable, String> {
        let shape = match (self.shape, self.dims.len()) {
            (Some(shape), _) => shape,
            (None, 0) => Vec::new(),
            (None, 1) => vec![self.data.len()],
            (None, n) => return Err(format!("shape is required for {n}-d variables")),
        };
        let fill = self
            .attrs
            .get("_FillValue")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(|| default_fill(self.dtype));
        let data = ArrayData::from_f64s(self.dtype, &self.data, fill);
        let mut variable = Variable::new(self.dims, shape, data).map_err(|err| err.to_string())?;
        variable.attrs = self.attrs;
        variable.encoding = self.encoding;
        Ok(variable)
    }

    fn from_variable(variable: &Variable) -> Self {
        let data = variable
            .data()
            .to_f64_vec()
            .into_iter()
            .map(|value| if value.is_finite() { Some(value) } else { None })
            .collect();
        Self {
            dims: variable.dims().to_vec(),
            shape: Some(variable.shape().to_vec()),
            dtype: variable.dtype(),
            data,
            attrs: variable.attrs.clone(),
            encoding: variable.encoding.clone(),
        }
    }
}

impl DatasetDocument {
    pub fn into_dataset(self) -> Result<Dataset, String> {
        let mut dataset = Dataset::new();
        dataset.attrs = self.attrs;
        for (name, doc) in self.coords {
            let variable = doc.into_variable().map_err(|err| format!("{name}: {err}"))?;
            dataset
                .insert(&name, variable, true)
                .map_err(|err| err.to_string())?;
        }
        for (name, doc) in self.data_vars {
            let variable = doc.into_variable().map_err(|err| format!("{name}: {err}"))?;
            dataset
                .insert(&name, variable, false)
                .map_err(|err| err.to_string())?;
        }
        Ok(dataset)
    }

    pub fn from_dataset(dataset: &Dataset) -> Self {
        let mut document = Self {
            attrs: dataset.attrs.clone(),
            ..Self::default()
        };
        for (name, variable) in dataset.variables() {
            let target = if dataset.is_coord(name) {
                &mut document.coords
            } else {
                &mut document.data_vars
            };
            target.insert(name.to_string(), VariableDocument::from_variable(variable));
        }
        document
    }
}

pub fn encode_document(dataset: &Dataset, gzip: bool) -> Result<Vec<u8>, IngestError> {
    let json = serde_json::to_vec(&DatasetDocument::from_dataset(dataset))
        .map_err(|err| IngestError::storage("document", err))?;
    if !gzip {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| IngestError::storage("document", err))?;
    encoder
        .finish()
        .map_err(|err| IngestError::storage("document", err))
}

#[derive(Clone)]
pub struct JsonDatasetReader {
    backends: Backends,
}

impl JsonDatasetReader {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }
}

impl SourceReader for JsonDatasetReader {
    fn open(&self, location: &SourceLocation) -> Result<Dataset, IngestError> {
        let decode_error = |reason: String| IngestError::Decode {
            location: location.to_string(),
            reason,
        };
        let store = self.backends.resolve(location)?;
        let raw = storage::get(&*store, location.key())?
            .ok_or_else(|| decode_error("object not found".to_string()))?;

        let json = if location.key().ends_with(".gz") {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|err| decode_error(format!("gzip: {err}")))?;
            decoded
        } else {
            raw
        };

        let document: DatasetDocument =
            serde_json::from_slice(&json).map_err(|err| decode_error(err.to_string()))?;
        document.into_dataset().map_err(decode_error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::{Location, Scheme};
    use crate::storage::{MemoryStore, put};

    fn sample() -> Dataset {
        Dataset::new()
            .with_coord("time", Variable::from_values("time", vec![86400i64]))
            .unwrap()
            .with_data_var(
                "sea_surface_temperature",
                Variable::new(
                    ["time", "lat"],
                    vec![1, 2],
                    ArrayData::from_vec(vec![290.5f32, f32::NAN]),
                )
                .unwrap(),
            )
            .unwrap()
            .with_attr("title", "sample")
    }

    #[test]
    fn reads_gzip_documents() {
        let memory = MemoryStore::new();
        put(&memory, "src/a.json.gz", encode_document(&sample(), true).unwrap()).unwrap();
        let reader = JsonDatasetReader::new(Backends::with_memory(Arc::new(memory)));
        let dataset = reader
            .open(&Location::new(Scheme::Memory, "src/a.json.gz"))
            .unwrap();
        let sst = dataset.get("sea_surface_temperature").unwrap();
        assert_eq!(sst.shape(), &[1, 2]);
        assert!(sst.data().get_f64(1).unwrap().is_nan());
        assert!(dataset.is_coord("time"));
    }

    #[test]
    fn malformed_document_is_a_decode_error() {
        let memory = MemoryStore::new();
        put(&memory, "src/bad.json", b"{not json".to_vec()).unwrap();
        let reader = JsonDatasetReader::new(Backends::with_memory(Arc::new(memory)));
        let err = reader
            .open(&Location::new(Scheme::Memory, "src/bad.json"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Decode { .. }));
    }
}
