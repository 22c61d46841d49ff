use std::sync::Arc;

use tracing::debug;

use crate::dataset::Dataset;
use crate::domain::{SourceLocation, VariableAllowList};
use crate::error::IngestError;
use crate::reader::SourceReader;

#[derive(Clone)]
pub struct SchemaNormalizer {
    reader: Arc<dyn SourceReader>,
    allow_list: Arc<VariableAllowList>,
    growth_dim: String,
}

impl SchemaNormalizer {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        allow_list: VariableAllowList,
        growth_dim: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            allow_list: Arc::new(allow_list),
            growth_dim: growth_dim.into(),
        }
    }

    pub fn allow_list(&self) -> &VariableAllowList {
        &self.allow_list
    }

    pub fn normalize(&self, location: &SourceLocation) -> Result<Dataset, IngestError> {
        let dataset = self.reader.open(location)?;
        let present = dataset.len();
        let normalized = self.project(dataset, location)?;
        debug!(
            %location,
            kept = normalized.len(),
            dropped = present - normalized.len(),
            "normalized source"
        );
        Ok(normalized)
    }

    /// Applies the allow-list to an already opened dataset. Running it on its
    /// own output changes nothing.
    pub fn project(
        &self,
        mut dataset: Dataset,
        location: &SourceLocation,
    ) -> Result<Dataset, IngestError> {
        dataset.retain(|name| self.allow_list.contains(name));
        if dataset.is_empty() {
            return Err(IngestError::Schema {
                location: location.to_string(),
                reason: "none of the allow-listed variables are present".to_string(),
            });
        }
        if dataset.coord_values(&self.growth_dim).is_none() {
            return Err(IngestError::Schema {
                location: location.to_string(),
                reason: format!("missing `{}` coordinate", self.growth_dim),
            });
        }
        Ok(dataset)
    }
}
