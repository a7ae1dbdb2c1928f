//! Prefixed capability naming.
//!
//! Every capability an upstream advertises is exposed downstream under
//! `<upstream>___<original>`. Upstream names may not contain the separator
//! (enforced at config load), but original names may, which is why parsing
//! splits on the *first* occurrence only.

/// Separator between the upstream name and the original capability id.
pub const PREFIX_SEPARATOR: &str = "___";

/// Build the externally visible id for a capability.
pub fn add_prefix(upstream: &str, name: &str) -> String {
    format!("{upstream}{PREFIX_SEPARATOR}{name}")
}

/// Split a prefixed id into `(upstream, original)`.
///
/// Splits on the first `___` so original names containing the separator
/// survive a round trip. Returns `None` when either half is empty.
pub fn split_prefix(prefixed: &str) -> Option<(&str, &str)> {
    let (upstream, name) = prefixed.split_once(PREFIX_SEPARATOR)?;
    if upstream.is_empty() || name.is_empty() {
        return None;
    }
    Some((upstream, name))
}
