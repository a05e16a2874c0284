//! Secret masking for anything that leaves the runner: command summaries,
//! persisted output excerpts, log lines and error messages.

use regex::Regex;
use std::sync::LazyLock;

pub const MASK: &str = "***MASKED***";

/// Pattern plus replacement template; `${1}` keeps the key prefix.
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"sk-ant-[A-Za-z0-9_-]{20,}", MASK),
        (r"sk-[A-Za-z0-9_-]{20,}", MASK),
        (r"tskey-[A-Za-z0-9-]+", MASK),
        (r"(authkey=)[^\s&]+", "${1}***MASKED***"),
        (r"(?i)(api[_-]?key[=:]\s*)[^\s&]+", "${1}***MASKED***"),
        (r"(?i)(password[=:]\s*)[^\s&]+", "${1}***MASKED***"),
        (r"(?i)(token[=:]\s*)[^\s&]+", "${1}***MASKED***"),
        (r"(?i)(secret[=:]\s*)[^\s&]+", "${1}***MASKED***"),
        (
            r"(?i)(\s--?[a-z0-9_-]*(?:passw(?:or)?d|passphrase|auth-?key|token|api[_-]?key|secret(?:[_-]key)?)\s+)[^\s'-][^\s']*",
            "${1}***MASKED***",
        ),
        (r"(?i)(authorization:\s*bearer\s+)\S+", "${1}***MASKED***"),
        (r"(?i)(x-api-key:\s*)\S+", "${1}***MASKED***"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("redaction patterns are valid"),
            replacement,
        )
    })
    .collect()
});

/// Flags whose following argument is a secret. Bare `-p` is left alone since
/// `mkdir -p` and `ssh -p` take no secret.
static SECRET_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--?[a-z0-9_-]*(?:passw(?:or)?d|passphrase|auth-?key|token|api[_-]?key|secret(?:[_-]key)?)$")
        .expect("secret flag pattern is valid")
});

/// Mask every known secret shape in `text`.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in PATTERNS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, *replacement).into_owned();
        }
    }
    out
}

/// Printable, redacted form of an argument vector.
///
/// The element after a secret-bearing flag such as `--password` is masked
/// whole.
pub fn command_summary(argv: &[String]) -> String {
    let joined = argv
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let after_secret_flag = i > 0 && SECRET_FLAG.is_match(&argv[i - 1]);
            if after_secret_flag {
                MASK.to_string()
            } else if a.is_empty() || a.contains(char::is_whitespace) {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    redact(&joined)
}

/// Redact then keep at most the last `max_bytes` bytes, cut on a char boundary.
///
/// The tail is kept because failures are usually reported at the end.
pub fn excerpt(output: &str, max_bytes: usize) -> String {
    let clean = redact(output);
    if clean.len() <= max_bytes {
        return clean;
    }
    let mut start = clean.len() - max_bytes;
    while !clean.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &clean[start..])
}
