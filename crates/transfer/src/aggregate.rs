//! Ordered reassembly of per-chunk outcomes.

use chunklift_chunker::Etag;

use crate::TransferError;

/// Sorts chunk results by index and checks they form exactly `0..expected`.
///
/// Workers complete in arbitrary order; finalize requires every index once,
/// ascending. A gap or duplicate here means the dispatcher's accounting is
/// broken, so it surfaces as a hard error rather than a bad manifest.
pub(crate) fn into_ordered(
    mut results: Vec<(u64, Etag)>,
    expected: u64,
) -> Result<Vec<Etag>, TransferError> {
    if results.len() as u64 != expected {
        return Err(TransferError::Accounting(format!(
            "got {} chunk results, expected {expected}",
            results.len()
        )));
    }

    results.sort_by_key(|(index, _)| *index);

    for (position, (index, _)) in results.iter().enumerate() {
        if *index != position as u64 {
            return Err(TransferError::Accounting(format!(
                "chunk index {index} at position {position}: indices must be contiguous from 0"
            )));
        }
    }

    Ok(results.into_iter().map(|(_, etag)| etag).collect())
}
