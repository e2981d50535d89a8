//! Client origins: how clients are identified to the permission layer.
//!
//! An origin is a URL-like string such as `https://example.org` or
//! `chrome-extension://<id>`. A missing origin denotes the application itself.

use url::Url;

pub const EXTENSION_SCHEME: &str = "chrome-extension";

const EXTENSION_ID_LENGTH: usize = 32;

/// Whether `s` has the shape of a bare extension id: 32 characters in `a..=p`.
pub fn looks_like_extension_id(s: &str) -> bool {
    s.len() == EXTENSION_ID_LENGTH && s.bytes().all(|b| (b'a'..=b'p').contains(&b))
}

/// `chrome-extension://<id>`.
pub fn from_extension_id(extension_id: &str) -> String {
    format!("{}://{}", EXTENSION_SCHEME, extension_id)
}

/// Extension id of an extension origin, `None` for any other origin.
pub fn extract_extension_id(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    if url.scheme() != EXTENSION_SCHEME {
        return None;
    }
    url.host_str().map(str::to_string)
}

/// Normalise a configured identifier: bare extension ids become extension
/// origins, everything else is kept verbatim.
pub fn normalize_identifier(identifier: &str) -> String {
    if looks_like_extension_id(identifier) {
        from_extension_id(identifier)
    } else {
        identifier.to_string()
    }
}

/// Short human-readable client name for log lines.
///
/// The extension id for extensions, `host[:port]` for web origins, the raw
/// string for anything unparsable and an empty string for the application
/// itself.
pub fn client_name_for_log(origin: Option<&str>) -> String {
    let Some(origin) = origin else {
        return String::new();
    };
    let Ok(url) = Url::parse(origin) else {
        return origin.to_string();
    };
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => origin.to_string(),
    }
}

/// Link shown next to an unknown client in the permission prompt.
pub fn client_info_link(origin: &str) -> String {
    match extract_extension_id(origin) {
        Some(extension_id) => format!(
            "https://chrome.google.com/webstore/detail/{}",
            extension_id
        ),
        None => origin.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENSION_ID: &str = "khpfeaanjngmcnplbdlpegiifgpfgdco";

    #[test]
    fn test_extension_id_detection() {
        assert!(looks_like_extension_id(EXTENSION_ID));
        assert!(!looks_like_extension_id("khpfeaanjngmcnplbdlpegiifgpfgdc"));
        assert!(!looks_like_extension_id("zhpfeaanjngmcnplbdlpegiifgpfgdco"));
        assert!(!looks_like_extension_id("https://example.org"));
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(
            normalize_identifier(EXTENSION_ID),
            format!("chrome-extension://{}", EXTENSION_ID)
        );
        assert_eq!(normalize_identifier("https://example.org"), "https://example.org");
    }

    #[test]
    fn test_extract_extension_id() {
        assert_eq!(
            extract_extension_id(&from_extension_id(EXTENSION_ID)).as_deref(),
            Some(EXTENSION_ID)
        );
        assert_eq!(extract_extension_id("https://example.org"), None);
        assert_eq!(extract_extension_id("not a url"), None);
    }

    #[test]
    fn test_client_name_for_log() {
        assert_eq!(client_name_for_log(None), "");
        assert_eq!(client_name_for_log(Some("https://example.org")), "example.org");
        assert_eq!(
            client_name_for_log(Some("http://localhost:8080")),
            "localhost:8080"
        );
        assert_eq!(
            client_name_for_log(Some(&from_extension_id(EXTENSION_ID))),
            EXTENSION_ID
        );
    }

    #[test]
    fn test_client_info_link() {
        assert_eq!(
            client_info_link(&from_extension_id(EXTENSION_ID)),
            format!("https://chrome.google.com/webstore/detail/{}", EXTENSION_ID)
        );
        assert_eq!(client_info_link("https://example.org"), "https://example.org");
    }
}
