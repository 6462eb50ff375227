//! Outbound message chunking under the provider's per-message ceiling.

/// Split `content` into chunks of at most `max_len` characters.
///
/// Each cut is placed at the last newline inside the window, else at the
/// last space, else exactly at `max_len`. A break character at the very start
/// of the window does not count. The remainder after each cut is trimmed of
/// leading whitespace, so break characters are consumed at the join point.
///
/// Lengths are counted in `char`s, never splitting a code point. A `max_len`
/// of zero is treated as one.
#[must_use]
pub fn split_message(content: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        // Byte offset of the first char past the window; absent when the
        // remainder already fits.
        let Some((window_end, _)) = rest.char_indices().nth(max_len) else {
            chunks.push(rest.to_owned());
            break;
        };

        let window = &rest[..window_end];
        let cut = window
            .rfind('\n')
            .filter(|&pos| pos > 0)
            .or_else(|| window.rfind(' ').filter(|&pos| pos > 0))
            .unwrap_or(window_end);

        chunks.push(rest[..cut].to_owned());
        rest = rest[cut..].trim_start();
    }

    chunks
}
