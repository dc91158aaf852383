//! Storage key sanitization
//!
//! Game servers persist state under a key derived from their display name.
//! Display names are free text, so they are reduced to a path-safe token
//! before being handed to the server on its command line.

/// Characters passed through unchanged once past the leading slash run
fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.')
}

/// Turn an arbitrary string into a storage-safe key
///
/// Every leading `/` becomes `_` (one per slash, not collapsed) so the key can
/// never be absolute. After the first non-slash character, ASCII letters,
/// digits, `/`, `_`, `-` and `.` pass through and everything else becomes `_`.
pub fn sanitize_storage_key(key: &str) -> String {
    let mut past_leading_slashes = false;
    key.chars()
        .map(|c| {
            if !past_leading_slashes && c == '/' {
                return '_';
            }
            past_leading_slashes = true;
            if is_allowed(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Storage key for a server, preferring its display name over its object name
pub fn storage_key_for(display_name: Option<&str>, object_name: &str) -> String {
    let source = display_name.filter(|n| !n.is_empty()).unwrap_or(object_name);
    sanitize_storage_key(source)
}
