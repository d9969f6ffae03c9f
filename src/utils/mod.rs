use url::Url;

use crate::{DownlyError, Result};

/// Validate a source URL and return its normalized form
pub fn validate_and_normalize_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DownlyError::Validation("URL is required".to_string()));
    }

    let parsed = Url::parse(url)
        .map_err(|_| DownlyError::Validation(format!("Invalid URL format: {url}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownlyError::Validation(
            "URL must use HTTP or HTTPS protocol".to_string(),
        ));
    }

    Ok(parsed.to_string())
}

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Make a content id safe for a filename. Whitespace is kept as is, surrounding included.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        })
        .collect()
}

/// Client-facing name for a download: `Downly_<id>.<ext>`
pub fn download_filename(content_id: Option<&str>, ext: &str) -> String {
    let id = content_id
        .map(sanitize_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "id".to_string());

    format!("Downly_{id}.{ext}")
}

/// `Content-Disposition` value with an ASCII fallback and an RFC 5987 UTF-8 name
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' && !c.is_ascii_control() { c } else { '_' })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}

/// Extract domain from URL for display purposes
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|host| {
        host.strip_prefix("www.").unwrap_or(host).to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("abc/def:123"), "abc_def_123");
        assert_eq!(sanitize_id("dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(sanitize_id("  7301-x.y  "), "  7301-x.y  ");
        assert_eq!(sanitize_id("ñ?"), "__");
    }

    #[test]
    fn test_download_filename() {
        assert_eq!(download_filename(Some("abc/def"), "mp4"), "Downly_abc_def.mp4");
        assert_eq!(download_filename(None, "mp3"), "Downly_id.mp3");
        assert_eq!(download_filename(Some(""), "mp4"), "Downly_id.mp4");
        assert_eq!(download_filename(Some(" 42 "), "mp4"), "Downly_ 42 .mp4");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("Downly_abc.mp4"),
            "attachment; filename=\"Downly_abc.mp4\"; filename*=UTF-8''Downly_abc.mp4"
        );

        let value = content_disposition("Downly_é.mp4");
        assert!(value.contains("filename=\"Downly__.mp4\""));
        assert!(value.ends_with("filename*=UTF-8''Downly_%C3%A9.mp4"));
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://www.youtube.com/watch?v=123"), Some("youtube.com".to_string()));
        assert_eq!(extract_domain("https://vm.tiktok.com/ZM1/"), Some("vm.tiktok.com".to_string()));
        assert_eq!(extract_domain("invalid-url"), None);
    }

    #[test]
    fn test_validate_and_normalize_url() {
        assert!(validate_and_normalize_url("https://example.com").is_ok());
        assert!(validate_and_normalize_url("http://example.com").is_ok());
        assert!(matches!(
            validate_and_normalize_url("ftp://example.com"),
            Err(DownlyError::Validation(_))
        ));
        assert!(validate_and_normalize_url("not-a-url").is_err());
        assert!(validate_and_normalize_url("   ").is_err());
    }
}
