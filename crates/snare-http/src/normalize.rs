//! URL normalization for rule matching.
//!
//! Matching compares URLs with their query string removed. Everything else
//! (scheme, authority, path, trailing slash, host casing, `www.`) is kept
//! exactly as the HTTP parser produced it.

/// Strip every query parameter (and any fragment) from a URL.
///
/// ```
/// use snare_http::normalize::normalize;
///
/// assert_eq!(normalize("http://x/a?b=1&c=2"), "http://x/a");
/// assert_eq!(normalize("http://x/a/"), "http://x/a/");
/// ```
pub fn normalize(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}

/// Split a normalized absolute URL into its origin and path.
///
/// Returns `None` for URLs that are not absolute (`scheme://authority...`).
/// An absolute URL with no path yields `/` as its path.
pub fn split_origin(url: &str) -> Option<(&str, &str)> {
    let scheme_end = url.find("://")?;
    let authority_start = scheme_end + 3;
    match url[authority_start..].find('/') {
        Some(offset) => {
            let path_start = authority_start + offset;
            Some((&url[..path_start], &url[path_start..]))
        }
        None => Some((url, "/")),
    }
}

/// Path component of a normalized URL, whether absolute or origin-form.
pub fn path_of(url: &str) -> &str {
    match split_origin(url) {
        Some((_, path)) => path,
        None => url,
    }
}

/// Parse a raw query string into ordered (name, value) pairs, percent-decoded.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|v| v.into_owned())
        .unwrap_or(spaced)
}
