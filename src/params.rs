use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

/// Raw query parameters of an image request, kept as text so that malformed
/// values can be judged individually instead of rejecting the whole query.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct ImageQuery {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub w: Option<String>,
    #[serde(default)]
    pub h: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
}

impl FromStr for ImageQuery {
    type Err = serde_urlencoded::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_urlencoded::from_str(s)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid image width: {0:?}")]
    InvalidWidth(Option<String>),
    #[error("invalid quality: {0:?}")]
    InvalidQuality(Option<String>),
}

/// Validated resize parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParams {
    pub width: u32,
    /// 0 keeps the aspect ratio.
    pub height: u32,
    pub quality: u8,
}

impl ImageQuery {
    /// Validates the query. Only the width can fail; a bad height means "auto"
    /// and a bad quality is replaced by `default_quality`.
    pub fn resolve(&self, default_quality: u8) -> Result<ImageParams, ParamError> {
        let width = parse_width(self.w.as_deref())?;
        let height = parse_height(self.h.as_deref());
        let quality = parse_quality(self.q.as_deref()).unwrap_or_else(|e| {
            tracing::debug!(error = %e, default_quality, "Using default quality");
            default_quality
        });
        Ok(ImageParams { width, height, quality })
    }
}

pub fn parse_width(raw: Option<&str>) -> Result<u32, ParamError> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|w| *w >= 1)
        .and_then(|w| u32::try_from(w).ok())
        .ok_or_else(|| ParamError::InvalidWidth(raw.map(str::to_string)))
}

pub fn parse_height(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|h| *h >= 1)
        .and_then(|h| u32::try_from(h).ok())
        .unwrap_or(0)
}

pub fn parse_quality(raw: Option<&str>) -> Result<u8, ParamError> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|q| (0..=100).contains(q))
        .map(|q| q as u8)
        .ok_or_else(|| ParamError::InvalidQuality(raw.map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_string() {
        let q: ImageQuery = "url=https%3A%2F%2Fexample.com%2Fa.jpg&w=300&h=abc&q=70"
            .parse()
            .unwrap();
        assert_eq!(q.url.as_deref(), Some("https://example.com/a.jpg"));
        assert_eq!(
            q.resolve(80).unwrap(),
            ImageParams { width: 300, height: 0, quality: 70 }
        );
    }

    #[test]
    fn width_is_required_and_positive() {
        assert!(parse_width(None).is_err());
        assert!(parse_width(Some("0")).is_err());
        assert!(parse_width(Some("-4")).is_err());
        assert!(parse_width(Some("wide")).is_err());
        assert_eq!(parse_width(Some("640")), Ok(640));
    }

    #[test]
    fn non_positive_height_means_auto() {
        assert_eq!(parse_height(None), 0);
        assert_eq!(parse_height(Some("0")), 0);
        assert_eq!(parse_height(Some("-10")), 0);
        assert_eq!(parse_height(Some("240")), 240);
    }

    #[test]
    fn quality_falls_back_to_default() {
        let query = |q: &str| ImageQuery {
            w: Some("10".into()),
            q: Some(q.into()),
            ..Default::default()
        };
        assert_eq!(query("0").resolve(80).unwrap().quality, 0);
        assert_eq!(query("100").resolve(80).unwrap().quality, 100);
        assert_eq!(query("101").resolve(80).unwrap().quality, 80);
        assert_eq!(query("-1").resolve(80).unwrap().quality, 80);
        assert_eq!(query("best").resolve(80).unwrap().quality, 80);
        assert_eq!(ImageQuery { w: Some("10".into()), ..Default::default() }.resolve(75).unwrap().quality, 75);
    }
}
