//! In-memory feature registries: tools, prompts, resources, roots
//! (spec.md §4.6). Registries are authoritative — built-in handlers never
//! consult anything else.

pub mod prompts;
pub mod resources;
pub mod roots;
pub mod tools;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::McpError;

pub use prompts::{PromptDescriptor, PromptRegistry};
pub use resources::{ResourceDescriptor, ResourceRegistry, ResourceTemplateDescriptor};
pub use roots::RootRegistry;
pub use tools::{ToolDescriptor, ToolRegistry};

/// Default page size for list operations when a caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Opaque pagination cursor: a base64-encoded decimal offset into the
/// registry's stable (alphabetical) iteration order.
pub fn encode_cursor(offset: usize) -> String {
    BASE64.encode(offset.to_string())
}

pub fn decode_cursor(cursor: &str) -> Result<usize, McpError> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|_| McpError::InvalidParams("malformed pagination cursor".into()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| McpError::InvalidParams("malformed pagination cursor".into()))?;
    text.parse::<usize>()
        .map_err(|_| McpError::InvalidParams("malformed pagination cursor".into()))
}

/// Slices `items` starting after `cursor` (or from the start if `None`),
/// returning up to `page_size` items and the cursor for the next page.
pub fn paginate<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    page_size: usize,
) -> Result<(Vec<T>, Option<String>), McpError> {
    let offset = match cursor {
        Some(c) => decode_cursor(c)?,
        None => 0,
    };
    if offset > items.len() {
        return Err(McpError::InvalidParams("pagination cursor out of range".into()));
    }
    let end = (offset + page_size).min(items.len());
    let page = items[offset..end].to_vec();
    let next = if end < items.len() {
        Some(encode_cursor(end))
    } else {
        None
    };
    Ok((page, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginates_stable_slice() {
        let items: Vec<i32> = (0..10).collect();
        let (page, next) = paginate(&items, None, 4).unwrap();
        assert_eq!(page, vec![0, 1, 2, 3]);
        let cursor = next.unwrap();
        let (page2, next2) = paginate(&items, Some(&cursor), 4).unwrap();
        assert_eq!(page2, vec![4, 5, 6, 7]);
        assert!(next2.is_some());
    }

    #[test]
    fn rejects_malformed_cursor() {
        let items = vec![1, 2, 3];
        assert!(paginate(&items, Some("not-base64!"), 2).is_err());
    }
}
