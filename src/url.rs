//! URL helpers shared by the proxy, the client transport and the server fetch.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// Query parameters keyed by name. `null` values are dropped when encoded.
pub type Query = BTreeMap<String, JsonValue>;

/// Joins URL parts with single slashes.
///
/// A leading `http://` / `https://` part only loses its trailing slashes so the
/// scheme survives; every other part is trimmed on both ends. Empty parts are
/// dropped.
///
/// ```
/// use enfyra_sdk::url::join_url;
///
/// assert_eq!(join_url(["https://api.x.com/", "/api/", "users"]), "https://api.x.com/api/users");
/// assert_eq!(join_url(["", "x"]), "x");
/// ```
#[must_use]
pub fn join_url<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join_url_opt(parts.into_iter().map(Some))
}

/// [`join_url`] over optional parts; `None` behaves like an empty part.
#[must_use]
pub fn join_url_opt<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();

    for part in parts.into_iter().flatten() {
        let part = part.as_ref();
        if part.is_empty() {
            continue;
        }
        if normalized.is_empty() && has_http_scheme(part) {
            normalized.push(part.trim_end_matches('/').to_string());
            continue;
        }
        let trimmed = part.trim_matches('/');
        if !trimmed.is_empty() {
            normalized.push(trimmed.to_string());
        }
    }

    normalized.join("/")
}

fn has_http_scheme(part: &str) -> bool {
    let lower = part
        .get(..8)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| part.to_ascii_lowercase());
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Splits `path?query` into the path and its decoded query pairs.
///
/// An empty path before `?` becomes `/`. Keys without `=` map to an empty
/// string; pairs with an empty key are skipped.
#[must_use]
pub fn split_path_query(raw: &str) -> (String, Query) {
    let Some((path, query_string)) = raw.split_once('?') else {
        return (raw.to_string(), Query::new());
    };

    let path = if path.is_empty() { "/" } else { path };
    let mut query = Query::new();

    for part in query_string.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        // Only the first `=` separates; anything after a second `=` is dropped.
        let value = value.split('=').next().unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        query.insert(decode_component(key), JsonValue::String(decode_component(value)));
    }

    (path.to_string(), query)
}

fn decode_component(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Layers query maps, later layers overriding earlier ones key by key.
#[must_use]
pub fn merge_query<'a, I>(layers: I) -> Query
where
    I: IntoIterator<Item = Option<&'a Query>>,
{
    let mut merged = Query::new();
    for layer in layers.into_iter().flatten() {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Renders query values as wire strings, skipping `null`.
#[must_use]
pub fn query_pairs(query: &Query) -> Vec<(String, String)> {
    query
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                JsonValue::Null => return None,
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), rendered))
        })
        .collect()
}
