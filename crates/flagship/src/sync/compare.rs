//! Manifest comparison.

use convoy_common::{ComparisonResult, ItemRef, Manifest};

/// Classify the differences between `reference` and `candidate`.
///
/// Runs in O(|reference| + |candidate|). Files with equal checksums on
/// both sides need no action and are not reported.
pub fn compare_files(reference: &Manifest, candidate: &Manifest) -> ComparisonResult {
    let mut result = ComparisonResult::default();

    for (name, entry) in reference {
        match candidate.get(name) {
            None => {
                result
                    .missing
                    .insert(name.clone(), ItemRef::new(&entry.cluster_item_key));
            }
            Some(other) if other.checksum != entry.checksum => {
                result
                    .shared
                    .insert(name.clone(), ItemRef::new(&entry.cluster_item_key));
            }
            Some(_) => {}
        }
    }

    for (name, entry) in candidate {
        if !reference.contains_key(name) {
            result
                .extra
                .insert(name.clone(), ItemRef::new(&entry.cluster_item_key));
        }
    }

    result
}
