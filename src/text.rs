//! Splitting page text into chunks sized for one summarisation call.

/// Characters per chunk when no size is given.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Split `text` into windows of `chunk_size` characters.
///
/// A window that would end in the middle of a word is extended up to the
/// next whitespace, provided whitespace occurs within the following window.
/// Windows that begin with whitespace are never extended.
/// At most `limit` chunks are returned when a limit is given.
pub fn split_into_chunks(text: &str, chunk_size: usize, limit: Option<usize>) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        if limit.map_or(false, |limit| chunks.len() >= limit) {
            break;
        }

        let end = (start + chunk_size).min(chars.len());
        let leading_blank = chars[start].is_whitespace();
        let mut chunk: String = chars[start..end].iter().collect();
        start = end;

        if start < chars.len() && !leading_blank && !chars[end - 1].is_whitespace() {
            let next_end = (start + chunk_size).min(chars.len());
            let next = &chars[start..next_end];
            if let Some(gap) = next.iter().position(|c| c.is_whitespace()) {
                chunk.extend(&next[..gap]);
                start += gap;
            }
        }

        chunks.push(chunk);
    }

    chunks
}
