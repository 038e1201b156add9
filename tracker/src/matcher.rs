use nalgebra::DVector;
use opencv::core::Point;

use crate::{PatchEmbeddings, PatchGrid};

/// Finds the index with the highest similarity.
///
/// Ties resolve to the lowest index and non-finite similarities never win. Returns `None`
/// when no similarity is finite.
pub fn best_match(similarities: &DVector<f32>) -> Option<usize> {
    let mut best = None::<(usize, f32)>;
    for (index, &similarity) in similarities.iter().enumerate() {
        if !similarity.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, best)| similarity > best) {
            best = Some((index, similarity));
        }
    }
    best.map(|(index, _)| index)
}

/// Matches `reference` against every patch and returns the winning patch center in working
/// resolution together with its similarity.
pub(crate) fn match_patch(
    grid: PatchGrid,
    embeddings: &PatchEmbeddings,
    reference: &DVector<f32>,
) -> Option<(Point, f32)> {
    let similarities = embeddings.similarities(reference);
    let index = best_match(&similarities)?;
    Some((grid.center_of(index), similarities[index]))
}
