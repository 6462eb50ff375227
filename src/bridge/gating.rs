//! Sender allow-listing.

/// Check whether a sender may reach the bus.
///
/// An empty allowlist means everyone is allowed. Otherwise the composite
/// `id|name` identifier matches when the whole string, or any `|`-separated
/// part of it, equals an entry. Matching is exact.
#[must_use]
pub fn is_allowed(sender_id: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    if allowlist.iter().any(|entry| entry == sender_id) {
        return true;
    }
    sender_id
        .split('|')
        .filter(|part| !part.is_empty())
        .any(|part| allowlist.iter().any(|entry| entry == part))
}

/// Join a raw sender id with its display name for allow-list matching.
///
/// Falls back to the bare id when the name is empty.
#[must_use]
pub fn composite_sender_id(sender_id: &str, sender_name: &str) -> String {
    if sender_name.is_empty() {
        sender_id.to_owned()
    } else {
        format!("{sender_id}|{sender_name}")
    }
}
