use std::collections::BTreeMap;
use std::fmt::Display;

use crate::core::Hash32;

/// Parameter strings longer than this are replaced by a fingerprint.
const MAX_INLINE_PARAMS: usize = 128;

/// Builds a canonical cache key for a request.
///
/// Parameters are sorted by name, so the same request always maps onto the
/// same key regardless of argument order. Long parameter sets are replaced by
/// a BLAKE3 fingerprint to keep keys short.
pub fn request_key<I, K, V>(endpoint: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Display,
    V: Display,
{
    let params: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if params.is_empty() {
        return endpoint.to_string();
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    if query.len() > MAX_INLINE_PARAMS {
        format!("{endpoint}#{}", Hash32::hash(&query).short_hex(16))
    } else {
        format!("{endpoint}?{query}")
    }
}
