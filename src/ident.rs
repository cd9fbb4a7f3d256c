/// Identifier canonicalization.
///
/// The portal's previous document store persisted record ids as native
/// object ids; exports and later write paths stored them as plain strings.
/// The same logical id can therefore appear as a bare 24-hex string (any
/// case), an `ObjectId("...")` wrapper, an extended-JSON `{"$oid": "..."}`
/// object, or an arbitrary string key. Every comparison in the engine goes
/// through `normalize_id`; raw column values are never compared directly.
///
/// Canonical form: lowercase hex for 24-hex ids, the trimmed string itself
/// otherwise. Malformed or absent values map to `None`, never a panic.
pub fn normalize_id(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("null") || t.eq_ignore_ascii_case("undefined") {
        return None;
    }

    if let Some(inner) = unwrap_object_id(t) {
        return normalize_id(inner);
    }
    if let Some(inner) = unwrap_extended_json(t) {
        return normalize_id(&inner);
    }

    if is_hex_24(t) {
        return Some(t.to_ascii_lowercase());
    }
    Some(t.to_string())
}

pub fn normalize_opt(raw: Option<&str>) -> Option<String> {
    raw.and_then(normalize_id)
}

/// True when both raw values denote the same canonical identifier.
/// Two absent/malformed values never match.
pub fn same_id(a: &str, b: &str) -> bool {
    match (normalize_id(a), normalize_id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn is_hex_24(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn unwrap_object_id(s: &str) -> Option<&str> {
    let rest = s.strip_prefix("ObjectId(")?;
    let rest = rest.strip_suffix(')')?;
    let rest = rest.trim();
    rest.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
}

fn unwrap_extended_json(s: &str) -> Option<String> {
    if !s.starts_with('{') {
        return None;
    }
    let v: serde_json::Value = serde_json::from_str(s).ok()?;
    v.get("$oid").and_then(|o| o.as_str()).map(|o| o.to_string())
}
