use crate::domain::{Batch, SourceLocation};
use crate::error::IngestError;

/// Splits `locations` into consecutive batches of `batch_size`, keeping order.
/// Only the last batch may be shorter.
pub fn partition(
    locations: Vec<SourceLocation>,
    batch_size: usize,
) -> Result<Vec<Batch>, IngestError> {
    if batch_size == 0 {
        return Err(IngestError::InvalidConfig(
            "batch size must be positive".to_string(),
        ));
    }
    let mut batches = Vec::with_capacity(locations.len().div_ceil(batch_size));
    let mut iter = locations.into_iter().peekable();
    while iter.peek().is_some() {
        let locations: Vec<_> = iter.by_ref().take(batch_size).collect();
        batches.push(Batch {
            index: batches.len(),
            locations,
        });
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Location, Scheme};

    fn locations(n: usize) -> Vec<SourceLocation> {
        (0..n)
            .map(|i| Location::new(Scheme::Memory, format!("src/{i:03}.json")))
            .collect()
    }

    #[test]
    fn last_batch_holds_the_remainder() {
        let batches = partition(locations(25), 10).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(batches[2].index, 2);
        assert_eq!(batches[2].locations[0].key(), "src/020.json");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(partition(locations(3), 0).is_err());
    }

    #[test]
    fn empty_input_gives_no_batches() {
        assert!(partition(Vec::new(), 4).unwrap().is_empty());
    }
}
