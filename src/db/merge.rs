//! Merge operator adaptation.

use std::sync::Arc;

use rocksdb::MergeOperands;

/// User merge callback: `(key, existing, update) -> merged`.
pub type MergeFn = Arc<dyn Fn(&[u8], Option<&[u8]>, &[u8]) -> Vec<u8> + Send + Sync>;

/// The default merge: with no existing value the update is taken
/// verbatim, otherwise the update replaces it.
pub fn take_update() -> MergeFn {
    Arc::new(|_key, _existing, update| update.to_vec())
}

/// Fold the library's operand list through the user callback.
pub(crate) fn adapt(
    user: MergeFn,
) -> impl Fn(&[u8], Option<&[u8]>, &MergeOperands) -> Option<Vec<u8>> + Clone + Send + Sync + 'static {
    move |key, existing, operands| {
        let mut acc: Option<Vec<u8>> = existing.map(|v| v.to_vec());
        for update in operands {
            let merged = match acc.as_deref() {
                // no existing value: the update is taken verbatim
                None => update.to_vec(),
                Some(existing) => user(key, Some(existing), update),
            };
            acc = Some(merged);
        }
        acc
    }
}
