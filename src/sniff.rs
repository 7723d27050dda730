/// Detects the MIME type of image bytes from their signature.
///
/// Raster formats are recognised through `image::guess_format` and only
/// reported when this build can decode them; SVG by its root element. Anything
/// else is `application/octet-stream`.
pub fn detect(bytes: &[u8]) -> &'static str {
    if let Ok(format) = image::guess_format(bytes) {
        if decodable(format) {
            return format.to_mime_type();
        }
        return "application/octet-stream";
    }
    if looks_like_svg(bytes) {
        return crate::negotiate::SVG;
    }
    "application/octet-stream"
}

// The `avif` codec feature only encodes; reading AVIF needs dav1d.
fn decodable(format: image::ImageFormat) -> bool {
    match format {
        image::ImageFormat::Avif => cfg!(feature = "avif-decode"),
        other => other.reading_enabled(),
    }
}

pub fn is_image(mime: &str) -> bool {
    mime.starts_with("image/")
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head).or_else(|e| std::str::from_utf8(&head[..e.valid_up_to()])) else {
        return false;
    };
    let mut rest = text.trim_start_matches('\u{feff}').trim_start();
    loop {
        if rest.starts_with("<svg") {
            return true;
        }
        // Skip prolog, doctype and comments ahead of the root element.
        let skipped = if rest.starts_with("<?") {
            rest.find("?>").map(|i| &rest[i + 2..])
        } else if rest.starts_with("<!--") {
            rest.find("-->").map(|i| &rest[i + 3..])
        } else if rest.starts_with("<!") {
            rest.find('>').map(|i| &rest[i + 1..])
        } else {
            None
        };
        match skipped {
            Some(next) => rest = next.trim_start(),
            None => return false,
        }
    }
}
