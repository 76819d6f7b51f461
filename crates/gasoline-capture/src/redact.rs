//! Secret scrubbing applied to tool output before it leaves the process.

use regex::Regex;
use tracing::warn;

struct Rule {
    name: &'static str,
    regex: Regex,
    replacement: String,
    validate: Option<fn(&str) -> bool>,
}

const BUILTIN: &[(&str, &str)] = &[
    ("aws-key", r"AKIA[0-9A-Z]{16}"),
    ("bearer-token", r"Bearer [A-Za-z0-9\-._~+/]+=*"),
    ("basic-auth", r"Basic [A-Za-z0-9+/]+=*"),
    ("jwt", r"eyJ[A-Za-z0-9_-]*\.eyJ[A-Za-z0-9_-]*\.[A-Za-z0-9_-]+"),
    ("github-pat", r"(ghp_[A-Za-z0-9]{36,}|github_pat_[A-Za-z0-9_]{36,})"),
    (
        "private-key",
        r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
    ),
    ("credit-card", r"\b[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}\b"),
    ("ssn", r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b"),
    ("api-key", r"(?i)(api[_-]?key|apikey|secret[_-]?key)\s*[:=]\s*[^\s,;&]+"),
    ("session-cookie", r"(?i)(session|sid|token)\s*=\s*[A-Za-z0-9+/=_-]{16,}"),
];

/// Text-to-text redaction pass over serialized tool results.
pub struct Redactor {
    rules: Vec<Rule>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        let mut rules = Vec::with_capacity(BUILTIN.len());
        for &(name, pattern) in BUILTIN {
            match Regex::new(pattern) {
                Ok(regex) => rules.push(Rule {
                    name,
                    regex,
                    replacement: format!("[REDACTED:{name}]"),
                    validate: (name == "credit-card").then_some(luhn_valid as fn(&str) -> bool),
                }),
                Err(e) => warn!(name, error = %e, "skipping redaction rule that does not compile"),
            }
        }
        Self { rules }
    }

    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for rule in &self.rules {
            if !rule.regex.is_match(&out) {
                continue;
            }
            out = match rule.validate {
                None => rule
                    .regex
                    .replace_all(&out, rule.replacement.as_str())
                    .into_owned(),
                Some(validate) => rule
                    .regex
                    .replace_all(&out, |caps: &regex::Captures<'_>| {
                        let matched = &caps[0];
                        if validate(matched) {
                            rule.replacement.clone()
                        } else {
                            matched.to_string()
                        }
                    })
                    .into_owned(),
            };
        }
        out
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
