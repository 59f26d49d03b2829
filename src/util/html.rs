//! Minimal attribute scanning over raw HTML.
//!
//! Uses simple string scanning (no HTML parser dependency). Tag and attribute
//! names are matched case-insensitively; attribute values keep their case.

/// Returns the `value_attr` of the first `<tag_name …>` whose `match_attr`
/// equals `match_value` (case-insensitive, quoted with `"` or `'`).
///
/// ```
/// use tubefeed::util::find_tag_attr;
///
/// let html = r#"<meta itemprop="duration" content="PT8M11S">"#;
/// assert_eq!(
///     find_tag_attr(html, "meta", "itemprop", "duration", "content"),
///     Some("PT8M11S")
/// );
/// ```
pub fn find_tag_attr<'a>(
    html: &'a str,
    tag_name: &str,
    match_attr: &str,
    match_value: &str,
    value_attr: &str,
) -> Option<&'a str> {
    let html_lower = html.to_ascii_lowercase();
    let open = format!("<{}", tag_name.to_ascii_lowercase());
    let match_value = match_value.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(tag_start) = html_lower[search_from..].find(&open) {
        let abs_start = search_from + tag_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        // `<link` must not match `<linkfoo`
        let after_name = remaining.as_bytes().get(open.len()).copied();
        let is_whole_name = after_name.is_some_and(|b| b.is_ascii_whitespace() || b == b'/');

        if is_whole_name {
            let tag = &remaining[..=tag_end];
            if contains_attr(tag, match_attr, &match_value) {
                // Extract from the original HTML to preserve value case
                let original_tag = &html[abs_start..abs_start + tag_end + 1];
                if let Some(value) = extract_attr_value(original_tag, value_attr) {
                    return Some(value);
                }
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

/// Checks if a lowercased tag contains an attribute with the given value.
fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

/// Extracts the value of an attribute from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!(" {attr_name}=");

    let attr_start = tag_lower.find(&attr_prefix)?;
    let value_start = attr_start + attr_prefix.len();

    let rest = tag.get(value_start..)?;
    let quote = *rest.as_bytes().first()?;

    if quote != b'"' && quote != b'\'' {
        return None;
    }

    let inner = &rest[1..];
    let end = inner.find(quote as char)?;

    Some(&inner[..end])
}
