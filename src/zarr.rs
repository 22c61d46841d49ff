use std::collections::BTreeMap;

use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zarrs::array::codec::GzipCodec;
use zarrs::array::{DataType, FillValue};

use crate::dataset::{Attributes, DType, with_dtype};
use crate::error::IngestError;

pub const METADATA_FILE: &str = "zarr.json";

/// Store-wide chunk compression, fixed when the store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compressor {
    Gzip { level: u32 },
}

impl Compressor {
    pub fn codec(&self) -> Result<GzipCodec, IngestError> {
        match self {
            Compressor::Gzip { level } => GzipCodec::new(*level)
                .map_err(|err| IngestError::InvalidConfig(format!("gzip level {level}: {err}"))),
        }
    }

    fn from_codecs(codecs: &[Value]) -> Option<Self> {
        codecs.iter().find_map(|codec| match codec.get("name")?.as_str()? {
            "gzip" => Some(Compressor::Gzip {
                level: codec
                    .pointer("/configuration/level")
                    .and_then(Value::as_u64)
                    .and_then(|level| u32::try_from(level).ok())?,
            }),
            _ => None,
        })
    }
}

pub fn data_type(dtype: DType) -> DataType {
    match dtype {
        DType::I8 => DataType::Int8,
        DType::U8 => DataType::UInt8,
        DType::I16 => DataType::Int16,
        DType::I32 => DataType::Int32,
        DType::I64 => DataType::Int64,
        DType::F32 => DataType::Float32,
        DType::F64 => DataType::Float64,
    }
}

fn dtype_from_name(name: &str) -> Option<DType> {
    match name {
        "int8" => Some(DType::I8),
        "uint8" => Some(DType::U8),
        "int16" => Some(DType::I16),
        "int32" => Some(DType::I32),
        "int64" => Some(DType::I64),
        "float32" => Some(DType::F32),
        "float64" => Some(DType::F64),
        _ => None,
    }
}

pub fn fill_value(dtype: DType, fill: f64) -> FillValue {
    with_dtype!(dtype, T => {
        let fill: T = fill.as_();
        FillValue::from(fill)
    })
}

pub fn node_path(root: &str, name: Option<&str>) -> String {
    let mut path = String::from("/");
    path.push_str(root.trim_matches('/'));
    if let Some(name) = name {
        if path.len() > 1 {
            path.push('/');
        }
        path.push_str(name);
    }
    path
}

pub fn metadata_key(root: &str, name: Option<&str>) -> String {
    let node = node_path(root, name);
    let node = node.trim_start_matches('/');
    if node.is_empty() {
        METADATA_FILE.to_string()
    } else {
        format!("{node}/{METADATA_FILE}")
    }
}

pub fn attributes_map(attrs: &Attributes) -> Map<String, Value> {
    attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDocument {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DType,
    pub compressor: Option<Compressor>,
    pub attrs: Attributes,
    metadata: Value,
}

#[derive(Deserialize)]
struct RawArray {
    shape: Vec<u64>,
    data_type: Value,
    chunk_grid: RawChunkGrid,
    #[serde(default)]
    codecs: Vec<Value>,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    dimension_names: Option<Vec<Option<String>>>,
}

#[derive(Deserialize)]
struct RawChunkGrid {
    configuration: RawChunkShape,
}

#[derive(Deserialize)]
struct RawChunkShape {
    chunk_shape: Vec<u64>,
}

impl ArrayDocument {
    pub fn parse(name: &str, metadata: &Value) -> Result<Self, IngestError> {
        let raw: RawArray =
            serde_json::from_value(metadata.clone()).map_err(|err| IngestError::storage(name, err))?;
        let dtype = raw
            .data_type
            .as_str()
            .and_then(dtype_from_name)
            .ok_or_else(|| IngestError::storage(name, format!("unsupported data type {}", raw.data_type)))?;
        let mut attrs = raw.attributes;
        // zarrs records its own version here.
        attrs.remove("_zarrs");
        let dims = match raw.dimension_names {
            Some(names) => names
                .into_iter()
                .enumerate()
                .map(|(axis, dim)| dim.unwrap_or_else(|| format!("dim_{axis}")))
                .collect(),
            None => (0..raw.shape.len()).map(|axis| format!("dim_{axis}")).collect(),
        };
        Ok(Self {
            dims,
            shape: raw.shape.iter().map(|len| *len as usize).collect(),
            chunks: raw
                .chunk_grid
                .configuration
                .chunk_shape
                .iter()
                .map(|len| *len as usize)
                .collect(),
            dtype,
            compressor: Compressor::from_codecs(&raw.codecs),
            attrs,
            metadata: metadata.clone(),
        })
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }
}

/// Adds the inline consolidated record of every array to a group document.
pub fn consolidate(mut group: Value, arrays: BTreeMap<String, Value>) -> Value {
    if let Value::Object(fields) = &mut group {
        fields.insert(
            "consolidated_metadata".to_string(),
            serde_json::json!({
                "kind": "inline",
                "must_understand": false,
                "metadata": arrays,
            }),
        );
    }
    group
}

pub fn split_consolidated(
    key: &str,
    group: &Value,
) -> Result<Option<(Attributes, BTreeMap<String, Value>)>, IngestError> {
    if group.get("node_type").and_then(Value::as_str) != Some("group") {
        return Err(IngestError::storage(key, "not a Zarr group"));
    }
    let Some(metadata) = group.pointer("/consolidated_metadata/metadata") else {
        return Ok(None);
    };
    let arrays = serde_json::from_value(metadata.clone()).map_err(|err| IngestError::storage(key, err))?;
    let mut attrs: Attributes = match group.get("attributes") {
        Some(attrs) => serde_json::from_value(attrs.clone()).map_err(|err| IngestError::storage(key, err))?,
        None => Attributes::new(),
    };
    attrs.remove("_zarrs");
    Ok(Some((attrs, arrays)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paths_below_a_group() {
        assert_eq!(node_path("zarr/sst.zarr", Some("time")), "/zarr/sst.zarr/time");
        assert_eq!(node_path("/zarr/sst.zarr/", None), "/zarr/sst.zarr");
        assert_eq!(metadata_key("zarr/sst.zarr", Some("time")), "zarr/sst.zarr/time/zarr.json");
        assert_eq!(metadata_key("zarr/sst.zarr", None), "zarr/sst.zarr/zarr.json");
    }

    #[test]
    fn array_document_reads_geometry() {
        let metadata = json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": [25, 2],
            "data_type": "float32",
            "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": [10, 2]}},
            "chunk_key_encoding": {"name": "default"},
            "fill_value": "NaN",
            "codecs": [
                {"name": "bytes", "configuration": {"endian": "little"}},
                {"name": "gzip", "configuration": {"level": 1}}
            ],
            "attributes": {"units": "kelvin"},
            "dimension_names": ["time", null]
        });
        let doc = ArrayDocument::parse("sst", &metadata).unwrap();
        assert_eq!(doc.dims, vec!["time", "dim_1"]);
        assert_eq!(doc.shape, vec![25, 2]);
        assert_eq!(doc.chunks, vec![10, 2]);
        assert_eq!(doc.dtype, DType::F32);
        assert_eq!(doc.compressor, Some(Compressor::Gzip { level: 1 }));
        assert_eq!(doc.attrs["units"], "kelvin");
    }

    #[test]
    fn unsupported_data_type_is_a_storage_error() {
        let metadata = json!({
            "shape": [1],
            "data_type": "complex64",
            "chunk_grid": {"configuration": {"chunk_shape": [1]}}
        });
        assert!(matches!(
            ArrayDocument::parse("z", &metadata),
            Err(IngestError::Storage { .. })
        ));
    }

    #[test]
    fn consolidated_record_roundtrip() {
        let group = json!({"zarr_format": 3, "node_type": "group", "attributes": {"title": "sst"}});
        let arrays = BTreeMap::from([("time".to_string(), json!({"shape": [3]}))]);
        let document = consolidate(group, arrays.clone());
        let (attrs, read) = split_consolidated("g", &document).unwrap().unwrap();
        assert_eq!(attrs["title"], "sst");
        assert_eq!(read, arrays);
    }

    #[test]
    fn gzip_level_is_validated() {
        assert!(Compressor::Gzip { level: 1 }.codec().is_ok());
        assert!(Compressor::Gzip { level: 42 }.codec().is_err());
    }
}
