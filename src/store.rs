use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use zarrs::array::{Array, ArrayBuilder, ArrayMetadata};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

use crate::dataset::{Attributes, Element, Variable, with_array, with_dtype};
use crate::domain::{Location, WriteMode};
use crate::error::IngestError;
use crate::merge::MergedDataset;
use crate::storage::{self, Backends};
use crate::zarr::{
    ArrayDocument, Compressor, attributes_map, consolidate, data_type, fill_value, metadata_key,
    node_path, split_consolidated,
};

type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

pub type ArrayLayout = ArrayDocument;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreLayout {
    pub arrays: BTreeMap<String, ArrayLayout>,
    pub attrs: Attributes,
}

impl StoreLayout {
    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.arrays.values().find_map(|array| {
            array
                .dims
                .iter()
                .position(|d| d == dim)
                .map(|axis| array.shape[axis])
        })
    }
}

struct ZarrGroup {
    storage: ReadableWritableListableStorage,
    root: String,
}

impl ZarrGroup {
    fn open(backends: &Backends, target: &Location) -> Result<Self, IngestError> {
        Ok(Self {
            storage: backends.resolve(target)?,
            root: target.key().to_string(),
        })
    }

    fn load_layout(&self) -> Result<Option<StoreLayout>, IngestError> {
        let key = metadata_key(&self.root, None);
        let Some(raw) = storage::get(&*self.storage, &key)? else {
            return Ok(None);
        };
        let document: Value =
            serde_json::from_slice(&raw).map_err(|err| IngestError::storage(&key, err))?;
        let (attrs, records) = split_consolidated(&key, &document)?
            .ok_or_else(|| IngestError::storage(&key, "group has no consolidated metadata"))?;
        let arrays = records
            .iter()
            .map(|(name, metadata)| {
                ArrayDocument::parse(name, metadata).map(|array| (name.clone(), array))
            })
            .collect::<Result<_, _>>()?;
        Ok(Some(StoreLayout { arrays, attrs }))
    }

    fn open_array(&self, name: &str, layout: &ArrayLayout) -> Result<StoreArray, IngestError> {
        let path = node_path(&self.root, Some(name));
        let metadata: ArrayMetadata = serde_json::from_value(layout.metadata().clone())
            .map_err(|err| IngestError::storage(&path, err))?;
        Array::new_with_metadata(self.storage.clone(), &path, metadata)
            .map_err(|err| IngestError::storage(path, err))
    }

    fn create_array(
        &self,
        name: &str,
        variable: &Variable,
        compressor: Option<Compressor>,
    ) -> Result<StoreArray, IngestError> {
        let path = node_path(&self.root, Some(name));
        let shape = variable.shape().iter().map(|len| *len as u64).collect();
        let chunks: Vec<u64> = chunk_shape(variable).iter().map(|len| *len as u64).collect();
        let mut builder = ArrayBuilder::new(
            shape,
            data_type(variable.dtype()),
            chunks.try_into().map_err(|err| IngestError::storage(&path, err))?,
            fill_value(variable.dtype(), variable.fill_value()),
        );
        builder
            .dimension_names(Some(variable.dims().iter().map(String::as_str)))
            .attributes(attributes_map(&variable.attrs));
        if let Some(compressor) = compressor {
            builder.bytes_to_bytes_codecs(vec![Arc::new(compressor.codec()?)]);
        }
        builder
            .build(self.storage.clone(), &path)
            .map_err(|err| IngestError::storage(path, err))
    }

    /// Array metadata first, then the group document carrying the
    /// consolidated record. Readers only trust the latter.
    fn commit(
        &self,
        arrays: &BTreeMap<String, StoreArray>,
        attrs: &Attributes,
    ) -> Result<(), IngestError> {
        let mut records = BTreeMap::new();
        for (name, array) in arrays {
            array
                .store_metadata()
                .map_err(|err| IngestError::storage(name, err))?;
            let record = serde_json::to_value(array.metadata())
                .map_err(|err| IngestError::storage(name, err))?;
            records.insert(name.clone(), record);
        }

        let path = node_path(&self.root, None);
        let group = GroupBuilder::new()
            .attributes(attributes_map(attrs))
            .build(self.storage.clone(), &path)
            .map_err(|err| IngestError::storage(&path, err))?;
        let document = serde_json::to_value(group.metadata())
            .map_err(|err| IngestError::storage(&path, err))?;
        let key = metadata_key(&self.root, None);
        let content = serde_json::to_vec_pretty(&consolidate(document, records))
            .map_err(|err| IngestError::storage(&key, err))?;
        storage::put(&*self.storage, &key, content)
    }

    fn read_array(&self, name: &str, layout: &ArrayLayout) -> Result<Variable, IngestError> {
        let array = self.open_array(name, layout)?;
        let subset = ArraySubset::new_with_shape(array.shape().to_vec());
        let data = with_dtype!(layout.dtype, T => T::wrap(
            array
                .retrieve_array_subset_ndarray::<T>(&subset)
                .map_err(|err| IngestError::storage(name, err))?
        ));
        let mut variable = Variable::new(layout.dims.clone(), layout.shape.clone(), data)?;
        variable.attrs = layout.attrs.clone();
        variable.set_chunks(layout.chunks.clone());
        Ok(variable)
    }
}

fn chunk_shape(variable: &Variable) -> Vec<usize> {
    variable
        .chunks()
        .map(<[usize]>::to_vec)
        .unwrap_or_else(|| variable.shape().iter().map(|len| (*len).max(1)).collect())
}

fn store_variable(
    name: &str,
    array: &StoreArray,
    variable: &Variable,
    origin: Vec<u64>,
    chunks: &[usize],
) -> Result<usize, IngestError> {
    let extent: Vec<u64> = variable.shape().iter().map(|len| *len as u64).collect();
    if extent.contains(&0) {
        return Ok(0);
    }
    let touched = origin
        .iter()
        .zip(&extent)
        .zip(chunks)
        .map(|((start, len), chunk)| {
            let chunk = *chunk as u64;
            ((start + len).div_ceil(chunk) - start / chunk) as usize
        })
        .product();
    let subset = ArraySubset::new_with_start_shape(origin, extent)
        .map_err(|err| IngestError::storage(name, err))?;
    with_array!(variable.data(), data => {
        let elements: Vec<_> = data.iter().copied().collect();
        array.store_array_subset_elements(&subset, elements.as_slice())
    })
    .map_err(|err| IngestError::storage(name, err))?;
    Ok(touched)
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteSummary {
    pub mode: WriteMode,
    pub records: usize,
    pub growth_len: usize,
    pub chunks_written: usize,
}

/// Persists merged batches, creating the store for the first batch and
/// appending along the growth dimension afterwards.
#[derive(Clone)]
pub struct StoreWriter {
    backends: Backends,
    growth_dim: String,
    compressor: Option<Compressor>,
}

impl StoreWriter {
    pub fn new(backends: Backends, growth_dim: impl Into<String>, compressor: Option<Compressor>) -> Self {
        Self {
            backends,
            growth_dim: growth_dim.into(),
            compressor,
        }
    }

    pub fn write(
        &self,
        merged: &MergedDataset,
        target: &Location,
        mode: WriteMode,
    ) -> Result<WriteSummary, IngestError> {
        if target.key().is_empty() {
            return Err(IngestError::InvalidLocation(format!(
                "{target}: refusing to write to the root of a backend"
            )));
        }
        let group = ZarrGroup::open(&self.backends, target)?;
        let result = match mode {
            WriteMode::Create => self.create(&group, merged),
            WriteMode::Append => self.append(&group, merged),
        };
        let summary = result.map_err(|err| match err {
            IngestError::Storage { key, reason } => IngestError::Write {
                target: target.to_string(),
                reason: format!("{key}: {reason}"),
            },
            other => other,
        })?;
        info!(
            batch = merged.batch,
            %target,
            %mode,
            records = summary.records,
            growth_len = summary.growth_len,
            "batch written"
        );
        Ok(summary)
    }

    fn create(&self, group: &ZarrGroup, merged: &MergedDataset) -> Result<WriteSummary, IngestError> {
        self.check_encodings(merged)?;
        storage::erase_dir(&*group.storage, &group.root)?;

        let mut arrays = BTreeMap::new();
        let mut chunks_written = 0;
        for (name, variable) in merged.dataset.variables() {
            let array = group.create_array(name, variable, self.compressor)?;
            let origin = vec![0; variable.shape().len()];
            chunks_written += store_variable(name, &array, variable, origin, &chunk_shape(variable))?;
            arrays.insert(name.to_string(), array);
        }

        let now = Utc::now().to_rfc3339();
        let mut attrs = merged.dataset.attrs.clone();
        attrs.insert("date_created".to_string(), json!(now));
        attrs.insert("date_modified".to_string(), json!(now));
        group.commit(&arrays, &attrs)?;

        Ok(WriteSummary {
            mode: WriteMode::Create,
            records: merged.growth_len,
            growth_len: merged.growth_len,
            chunks_written,
        })
    }

    /// Every chunk of every array is written before any metadata, so a
    /// failure part-way leaves both the array and group documents unchanged.
    fn append(&self, group: &ZarrGroup, merged: &MergedDataset) -> Result<WriteSummary, IngestError> {
        let layout = group.load_layout()?.ok_or_else(|| IngestError::Write {
            target: group.root.clone(),
            reason: "store does not exist; the first batch must create it".to_string(),
        })?;
        self.check_encodings(merged)?;
        let offset = layout.dim_len(&self.growth_dim).unwrap_or(0);
        self.check_append_geometry(&layout, merged)?;

        let new_len = offset + merged.growth_len;
        let mut arrays = BTreeMap::new();
        let mut chunks_written = 0;
        for (name, existing) in &layout.arrays {
            let mut array = group.open_array(name, existing)?;
            let growth_axis = existing.dims.iter().position(|d| *d == self.growth_dim);
            let mut origin = vec![0; existing.shape.len()];
            if let Some(axis) = growth_axis {
                let mut shape: Vec<u64> = existing.shape.iter().map(|len| *len as u64).collect();
                shape[axis] = new_len as u64;
                array.set_shape(shape);
                origin[axis] = offset as u64;
            }
            // Arrays absent from this batch only grow; the new records read as fill.
            if let Some(variable) = merged.dataset.get(name) {
                chunks_written += store_variable(name, &array, variable, origin, &existing.chunks)?;
                array
                    .attributes_mut()
                    .extend(attributes_map(&variable.attrs));
            }
            arrays.insert(name.clone(), array);
        }

        let mut attrs = layout.attrs.clone();
        let created = attrs.get("date_created").cloned();
        attrs.extend(merged.dataset.attrs.clone());
        if let Some(created) = created {
            attrs.insert("date_created".to_string(), created);
        }
        attrs.insert("date_modified".to_string(), json!(Utc::now().to_rfc3339()));
        group.commit(&arrays, &attrs)?;

        debug!(offset, new_len, "appended records");
        Ok(WriteSummary {
            mode: WriteMode::Append,
            records: merged.growth_len,
            growth_len: new_len,
            chunks_written,
        })
    }

    fn check_encodings(&self, merged: &MergedDataset) -> Result<(), IngestError> {
        for (name, variable) in merged.dataset.variables() {
            let Some(hint) = variable.encoding.get("chunks") else {
                continue;
            };
            let hinted: Option<Vec<usize>> = serde_json::from_value(hint.clone()).ok();
            if hinted.as_deref() != variable.chunks() {
                return Err(IngestError::Geometry {
                    variable: name.to_string(),
                    reason: format!(
                        "conflicting encoding: chunks hint {hint} differs from layout {:?}",
                        variable.chunks()
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_append_geometry(
        &self,
        layout: &StoreLayout,
        merged: &MergedDataset,
    ) -> Result<(), IngestError> {
        for (name, variable) in merged.dataset.variables() {
            let geometry_error = |reason: String| IngestError::Geometry {
                variable: name.to_string(),
                reason,
            };
            let existing = layout
                .arrays
                .get(name)
                .ok_or_else(|| geometry_error("not present in the existing store".to_string()))?;
            if existing.dims != variable.dims() {
                return Err(geometry_error(format!(
                    "dims {:?} differ from store dims {:?}",
                    variable.dims(),
                    existing.dims
                )));
            }
            if existing.dtype != variable.dtype() {
                return Err(geometry_error(format!(
                    "dtype {} differs from store dtype {}",
                    variable.dtype(),
                    existing.dtype
                )));
            }
            let chunks = chunk_shape(variable);
            for (axis, dim) in existing.dims.iter().enumerate() {
                if chunks[axis] != existing.chunks[axis] {
                    return Err(geometry_error(format!(
                        "chunk length {} along `{dim}` differs from store chunk length {}",
                        chunks[axis], existing.chunks[axis]
                    )));
                }
                if *dim != self.growth_dim && variable.shape()[axis] != existing.shape[axis] {
                    return Err(geometry_error(format!(
                        "length {} along `{dim}` differs from store length {}",
                        variable.shape()[axis],
                        existing.shape[axis]
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArraySummary {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub location: String,
    pub arrays: Vec<ArraySummary>,
    pub attrs: Attributes,
}

pub struct StoreReader {
    group: ZarrGroup,
    location: Location,
    layout: StoreLayout,
}

impl StoreReader {
    pub fn open(backends: &Backends, target: &Location) -> Result<Self, IngestError> {
        Self::try_open(backends, target)?
            .ok_or_else(|| IngestError::storage(target.to_string(), "no Zarr group found"))
    }

    pub fn try_open(backends: &Backends, target: &Location) -> Result<Option<Self>, IngestError> {
        let group = ZarrGroup::open(backends, target)?;
        Ok(group.load_layout()?.map(|layout| Self {
            group,
            location: target.clone(),
            layout,
        }))
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.layout.dim_len(dim)
    }

    pub fn read_variable(&self, name: &str) -> Result<Variable, IngestError> {
        let array = self
            .layout
            .arrays
            .get(name)
            .ok_or_else(|| IngestError::storage(name, "no such array"))?;
        self.group.read_array(name, array)
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            location: self.location.to_string(),
            arrays: self
                .layout
                .arrays
                .iter()
                .map(|(name, array)| ArraySummary {
                    name: name.clone(),
                    dims: array.dims.clone(),
                    shape: array.shape.clone(),
                    chunks: array.chunks.clone(),
                    dtype: array.dtype.to_string(),
                })
                .collect(),
            attrs: self.layout.attrs.clone(),
        }
    }
}
