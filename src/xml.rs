//! Tolerant, namespace-insensitive tag extraction shared by `auth` (SOAP
//! Login responses) and `protocol::codec` (method-call responses). Keeps
//! the source's substring-regex approach (see DESIGN NOTES) but requires
//! the tag to actually be present rather than guessing at offsets.

use regex::Regex;

pub(crate) fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"(?is)<(?:\w+:)?{tag}(?:\s[^>]*)?>(.*?)</(?:\w+:)?{tag}>",
        tag = regex::escape(tag)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml).map(|c| c[1].trim().to_string())
}
