use convert_case::{Case, Casing};
use snafu::{ensure, OptionExt, ResultExt};
use url::Url;

use super::store::{ConfigError, InvalidUriSnafu, MissingHostSnafu};

pub const DEFAULT_RESOURCE_PATH: &str = "/ipp/print";

/// Normalizes a user supplied printer address into an `ipp://` or `ipps://` URI.
///
/// Bare hosts get the `ipp` scheme, `http`/`https` map onto `ipp`/`ipps` and
/// an empty resource path becomes [`DEFAULT_RESOURCE_PATH`].
pub fn normalize_printer_uri(raw: &str, force_secure: bool) -> Result<String, ConfigError> {
    let value = raw.trim();
    ensure!(!value.is_empty(), MissingHostSnafu { uri: raw });

    let with_scheme = if value.contains("://") { value.to_owned() } else { format!("ipp://{value}") };
    let parsed = Url::parse(&with_scheme).context(InvalidUriSnafu { uri: raw })?;

    let secure = force_secure || matches!(parsed.scheme(), "ipps" | "https");
    let scheme = if secure { "ipps" } else { "ipp" };
    let host = parsed.host_str().filter(|host| !host.is_empty()).context(MissingHostSnafu { uri: raw })?;
    let port = parsed.port().map(|port| format!(":{port}")).unwrap_or_default();
    let path = normalize_resource_path(parsed.path());
    let query = parsed.query().map(|query| format!("?{query}")).unwrap_or_default();

    Ok(format!("{scheme}://{host}{port}{path}{query}"))
}

/// Collapses duplicate and trailing slashes, defaulting to `/ipp/print`.
pub fn normalize_resource_path(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        DEFAULT_RESOURCE_PATH.to_owned()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Turns a display name into a stable snake_case identifier.
pub fn printer_slug(value: &str) -> String {
    let snake = value.trim().to_case(Case::Snake);
    let mut slug = String::with_capacity(snake.len());
    for c in snake.chars() {
        let c = if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' };
        if c == '_' && (slug.is_empty() || slug.ends_with('_')) {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_end_matches('_').to_owned();
    if slug.is_empty() { "printer".to_owned() } else { slug }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_ipp_scheme_and_default_path() {
        assert_eq!(normalize_printer_uri("192.168.1.20", false).unwrap(), "ipp://192.168.1.20/ipp/print");
    }

    #[test]
    fn http_schemes_map_to_ipp() {
        assert_eq!(
            normalize_printer_uri("https://printer.local:631/ipp/print/", false).unwrap(),
            "ipps://printer.local:631/ipp/print"
        );
        assert_eq!(
            normalize_printer_uri("http://cups.lan:631//printers/office", false).unwrap(),
            "ipp://cups.lan:631/printers/office"
        );
    }

    #[test]
    fn secure_flag_upgrades_scheme() {
        assert_eq!(normalize_printer_uri("ipp://printer.local/ipp/print", true).unwrap(), "ipps://printer.local/ipp/print");
    }

    #[test]
    fn empty_uri_is_rejected() {
        assert!(normalize_printer_uri("   ", false).is_err());
    }

    #[test]
    fn slugs_are_snake_case() {
        assert_eq!(printer_slug("Office Printer"), "office_printer");
        assert_eq!(printer_slug("  ET-3850 #2 "), "et_3850_2");
        assert_eq!(printer_slug("***"), "printer");
    }
}
