//! Header names the gateway reads and writes, forwarding of backend headers
//! by prefix, and the framing checks run on inbound requests.

use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};

/// Header carrying the transaction id, both inbound and on every response.
pub const TRANSACTION_ID_HEADER: &str = "x-webpa-transaction-id";

/// Header carrying the new collection id of a test-and-set request.
pub const SYNC_NEW_CID_HEADER: &str = "x-webpa-sync-new-cid";

/// Header carrying the old collection id of a test-and-set request.
pub const SYNC_OLD_CID_HEADER: &str = "x-webpa-sync-old-cid";

/// Header carrying the sync marker of a test-and-set request.
pub const SYNC_CMC_HEADER: &str = "x-webpa-sync-cmc";

/// Copies every header of `from` whose name starts with `prefix` into `to`.
///
/// The comparison ignores ASCII case, since header names are stored
/// lowercased. Multi-valued headers keep all of their values. An empty
/// prefix forwards everything.
pub fn forward_by_prefix(prefix: &str, from: &HeaderMap, to: &mut HeaderMap) {
    let prefix = prefix.to_ascii_lowercase();
    from.iter()
        .filter(|(name, _)| name.as_str().starts_with(&prefix))
        .for_each(|(name, value)| {
            to.append(name.clone(), value.clone());
        });
}

/// Returns the value of `name` as a string, treating absent, empty, and
/// non-UTF-8 values alike as missing.
pub fn non_empty(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|val| val.to_str().ok())
        .map(str::trim)
        .filter(|val| !val.is_empty())
        .map(str::to_owned)
}

/// Sets the transaction id header, ignoring values that are not valid
/// header values.
pub fn set_transaction_id(headers: &mut HeaderMap, transaction_id: &str) {
    if let Ok(val) = HeaderValue::from_str(transaction_id) {
        headers.insert(TRANSACTION_ID_HEADER, val);
    }
}

/// An inbound request declaring its body length twice, once by
/// `Content-Length` and once by `Transfer-Encoding`, is ambiguous and
/// rejected before routing.
pub fn is_smuggling_attempt(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_LENGTH) && headers.contains_key(TRANSFER_ENCODING)
}

/// Whether a declared `Content-Length` is over `max_bytes`.
///
/// Bodies without a usable declared length are bounded while they are read
/// instead.
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|len| len.trim().parse::<u64>().ok())
        .is_some_and(|len| len > max_bytes)
}
