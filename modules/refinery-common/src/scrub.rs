use regex::Regex;
use std::sync::LazyLock;

static CREDIT_CARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{4}-\d{4}-\d{4}\b").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b").unwrap());
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}[-.]\d{3}[-.]\d{4}\b").unwrap());
static SSN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

/// Redact PII before anything is persisted or forwarded to the model.
/// Returns `None` to veto the text entirely (binary garbage only; NUL
/// bytes mean the "text" was never text).
///
/// Idempotent: the placeholders contain no digits or `@`, so a second
/// pass leaves them alone.
pub fn scrub_pii(text: &str) -> Option<String> {
    if text.contains('\0') {
        return None;
    }

    let scrubbed = CREDIT_CARD_RE.replace_all(text, "[CREDIT_CARD]");
    let scrubbed = EMAIL_RE.replace_all(&scrubbed, "[EMAIL]");
    let scrubbed = SSN_RE.replace_all(&scrubbed, "[SSN]");
    let scrubbed = PHONE_RE.replace_all(&scrubbed, "[PHONE]");

    Some(scrubbed.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credit_card() {
        let out = scrub_pii("pay with 4111-1111-1111-1111 today").unwrap();
        assert_eq!(out, "pay with [CREDIT_CARD] today");
    }

    #[test]
    fn redacts_email() {
        let out = scrub_pii("reach me at tips@example.com please").unwrap();
        assert_eq!(out, "reach me at [EMAIL] please");
    }

    #[test]
    fn redacts_phone_and_ssn() {
        let out = scrub_pii("call 612-555-1234 or ssn 123-45-6789").unwrap();
        assert_eq!(out, "call [PHONE] or ssn [SSN]");
    }

    #[test]
    fn clean_text_unchanged() {
        let text = "Central bank hikes rates 25bp.";
        assert_eq!(scrub_pii(text).unwrap(), text);
    }

    #[test]
    fn scrub_is_idempotent() {
        let once = scrub_pii("card 4111-1111-1111-1111, mail a@b.co").unwrap();
        let twice = scrub_pii(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn vetoes_nul_bytes() {
        assert!(scrub_pii("binary\0junk").is_none());
    }
}
