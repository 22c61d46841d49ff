use std::collections::BTreeSet;

use tracing::debug;

use crate::dataset::{Dataset, Variable};
use crate::domain::{ChunkGeometry, SourceLocation};
use crate::error::IngestError;
use crate::executor::BatchOutcomes;

/// One batch concatenated along the growth dimension and rechunked.
#[derive(Debug)]
pub struct MergedDataset {
    pub batch: usize,
    pub dataset: Dataset,
    pub sources: Vec<SourceLocation>,
    pub growth_len: usize,
}

#[derive(Debug, Clone)]
pub struct BatchMerger {
    growth_dim: String,
    geometry: ChunkGeometry,
}

impl BatchMerger {
    pub fn new(growth_dim: impl Into<String>, geometry: ChunkGeometry) -> Self {
        Self {
            growth_dim: growth_dim.into(),
            geometry,
        }
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub fn merge(&self, outcomes: BatchOutcomes) -> Result<MergedDataset, IngestError> {
        let batch = outcomes.batch;
        let mut entries = outcomes.into_datasets();
        if entries.is_empty() {
            return Err(IngestError::Geometry {
                variable: self.growth_dim.clone(),
                reason: format!("batch {batch} has no datasets to merge"),
            });
        }

        // Order by each dataset's own growth coordinate; ties keep listing order.
        entries.sort_by(|(_, a), (_, b)| {
            self.first_growth_value(a)
                .total_cmp(&self.first_growth_value(b))
        });
        let datasets: Vec<&Dataset> = entries.iter().map(|(_, ds)| ds).collect();
        self.check_fixed_dims(&datasets)?;

        let mut merged = Dataset::new();
        let names: BTreeSet<&str> = datasets
            .iter()
            .flat_map(|ds| ds.variable_names())
            .collect();
        for name in names {
            let is_coord = datasets.iter().any(|ds| ds.is_coord(name));
            let variable = self.merge_variable(name, &datasets)?;
            merged.insert(name, variable, is_coord)?;
        }
        for ds in &datasets {
            merged.attrs.extend(ds.attrs.clone());
        }

        self.rechunk(&mut merged);
        let growth_len = merged.dim_len(&self.growth_dim).unwrap_or(0);
        let sources = entries.iter().map(|(loc, _)| loc.clone()).collect();
        debug!(batch, growth_len, variables = merged.len(), "merged batch");
        Ok(MergedDataset {
            batch,
            dataset: merged,
            sources,
            growth_len,
        })
    }

    fn first_growth_value(&self, dataset: &Dataset) -> f64 {
        dataset
            .coord_values(&self.growth_dim)
            .and_then(|values| values.first().copied())
            .unwrap_or(f64::INFINITY)
    }

    fn check_fixed_dims(&self, datasets: &[&Dataset]) -> Result<(), IngestError> {
        let first = datasets[0];
        for ds in &datasets[1..] {
            for (dim, len) in ds.dims() {
                if *dim == self.growth_dim {
                    continue;
                }
                if let Some(expected) = first.dim_len(dim) {
                    if expected != *len {
                        return Err(IngestError::Geometry {
                            variable: dim.clone(),
                            reason: format!(
                                "dimension length {len} differs from {expected} within one batch"
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_variable(&self, name: &str, datasets: &[&Dataset]) -> Result<Variable, IngestError> {
        let present: Vec<&Variable> = datasets.iter().filter_map(|ds| ds.get(name)).collect();
        let template = present[0];
        let Some(axis) = template.axis_of(&self.growth_dim) else {
            if present.iter().any(|var| var.axis_of(&self.growth_dim).is_some()) {
                return Err(IngestError::Geometry {
                    variable: name.to_string(),
                    reason: format!("only some files lay it out along `{}`", self.growth_dim),
                });
            }
            // Later files win for variables that do not grow.
            let mut latest = present[present.len() - 1].clone();
            latest.encoding.clear();
            return Ok(latest);
        };

        let fillers: Vec<Option<Variable>> = datasets
            .iter()
            .map(|ds| match ds.get(name) {
                Some(_) => None,
                None => {
                    let records = ds.dim_len(&self.growth_dim).unwrap_or(0);
                    Some(template.filled_like(axis, records))
                }
            })
            .collect();
        let parts: Vec<&Variable> = datasets
            .iter()
            .zip(&fillers)
            .filter_map(|(ds, filler)| ds.get(name).or(filler.as_ref()))
            .collect();
        Variable::concat(name, &parts, axis)
    }

    fn rechunk(&self, dataset: &mut Dataset) {
        for (_, variable) in dataset.variables_mut() {
            let chunks = variable
                .dims()
                .iter()
                .zip(variable.shape())
                .map(|(dim, size)| self.geometry.chunk_len(dim, *size, &self.growth_dim))
                .collect();
            variable.set_chunks(chunks);
            variable.encoding.clear();
        }
    }
}
