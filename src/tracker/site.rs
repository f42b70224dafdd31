use url::Url;

/// Pages that never start a session: browser internals and extension pages.
pub const DEFAULT_IGNORED_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "edge://",
    "about:",
    "moz-extension://",
    "devtools://",
    "view-source:",
    "file://",
];

/// Reduces a URL or bare host to the lowercase hostname used as site key.
/// Scheme, port, path, query and fragment are dropped.
pub fn site_key(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{trimmed}"))
    }
    .ok()?;

    let host = parsed.host_str()?.trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone)]
pub struct IgnoreList {
    prefixes: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| prefix.as_ref().trim().to_ascii_lowercase())
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn is_ignored(&self, input: &str) -> bool {
        let lower = input.trim().to_ascii_lowercase();
        self.prefixes.iter().any(|prefix| lower.starts_with(prefix))
    }
}

impl Default for IgnoreList {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_PREFIXES)
    }
}
