//! Redaction of secrets and identifiers before text reaches a log line.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

static JWT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*").expect("valid JWT pattern")
});

static BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*").expect("valid bearer pattern")
});

static FORM_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(client_secret|password|client_assertion|refresh_token|access_token|code_verifier|device_code)=([^&\s]+)",
    )
    .expect("valid form field pattern")
});

static JSON_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)"(client_secret|password|client_assertion|refresh_token|access_token|device_code)"\s*:\s*"[^"]*""#,
    )
    .expect("valid JSON field pattern")
});

static SHELL_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(-(?:AccessToken|String)\s+)('(?:[^']|'')*'|\S+)")
        .expect("valid shell argument pattern")
});

static GUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("valid GUID pattern")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email pattern")
});

/// Scrubs bearer credentials, form and JSON secrets, shell arguments that
/// carry tokens, and (optionally) tenant/object ids and e-mail addresses.
///
/// Built once at startup and handed to every component that logs remote
/// detail.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    redact_identifiers: bool,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sanitizer {
    pub fn new() -> Self {
        Self {
            redact_identifiers: true,
        }
    }

    /// Keep GUIDs and e-mail addresses readable. Secrets are still redacted.
    pub fn keep_identifiers() -> Self {
        Self {
            redact_identifiers: false,
        }
    }

    pub fn sanitize(&self, input: &str) -> String {
        let mut text: Cow<'_, str> = Cow::Borrowed(input);

        text = replace(text, &JWT, "[REDACTED_TOKEN]");
        text = replace(text, &BEARER, "${1}[REDACTED_TOKEN]");
        text = replace(text, &FORM_SECRET, "${1}=[REDACTED]");
        text = replace(text, &JSON_SECRET, "\"${1}\":\"[REDACTED]\"");
        text = replace(text, &SHELL_SECRET, "${1}[REDACTED]");

        if self.redact_identifiers {
            text = replace(text, &GUID, "[REDACTED_ID]");
            text = replace(text, &EMAIL, "[REDACTED_EMAIL]");
        }

        text.into_owned()
    }
}

fn replace<'a>(text: Cow<'a, str>, pattern: &Regex, replacement: &str) -> Cow<'a, str> {
    let changed = match pattern.replace_all(&text, replacement) {
        Cow::Borrowed(_) => None,
        Cow::Owned(changed) => Some(changed),
    };
    match changed {
        Some(changed) => Cow::Owned(changed),
        None => text,
    }
}
