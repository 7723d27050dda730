//! Output format selection from the source type and the client's `Accept` list.

pub const SVG: &str = "image/svg+xml";
pub const WEBP: &str = "image/webp";
pub const AVIF: &str = "image/avif";
pub const PNG: &str = "image/png";

/// Chooses the MIME type to encode to.
///
/// WebP wins whenever the client accepts it, even over AVIF. AVIF is only kept
/// for AVIF sources. WebP and AVIF sources the client cannot take fall back to
/// PNG. SVG is never re-encoded.
pub fn choose_format(source: &str, accepted: &[String]) -> String {
    if source == SVG {
        return SVG.to_string();
    }
    if accepts(accepted, WEBP) {
        return WEBP.to_string();
    }
    match source {
        AVIF if accepts(accepted, AVIF) => AVIF.to_string(),
        WEBP | AVIF => PNG.to_string(),
        other => other.to_string(),
    }
}

pub fn accepts(accepted: &[String], mime: &str) -> bool {
    accepted.iter().any(|a| a == mime)
}

/// Splits an `Accept` header into bare media types, dropping parameters such as `q=`.
pub fn parse_accept(header: &str) -> Vec<String> {
    header
        .split(',')
        .filter_map(|part| {
            let media = part.split(';').next().unwrap_or("").trim();
            (!media.is_empty()).then(|| media.to_ascii_lowercase())
        })
        .collect()
}
