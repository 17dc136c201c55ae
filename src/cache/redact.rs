use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;

static IP_ADDRESS_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""ipAddress"\s*:\s*"[^"]*""#).expect("static regex")
});

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static regex")
});

/// Masks client IP addresses before a cached value reaches the logs.
pub fn redact(text: &str) -> Cow<'_, str> {
    let fields = IP_ADDRESS_FIELD.replace_all(text, r#""ipAddress":"<REDACTED>""#);
    if !IPV4.is_match(&fields) {
        return fields;
    }
    Cow::Owned(IPV4.replace_all(&fields, "<REDACTED>").into_owned())
}
