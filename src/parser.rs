//! Decoding of delimiter-separated model output.
//!
//! Language models are asked to answer in a flat, delimited line ("ratio A ****
//! ratio B ****..."), but nothing enforces the format. Everything here is total:
//! count mismatches are reported as values and numeric coercion returns `None`
//! instead of failing, so callers decide what is fatal.

use std::fmt;

use tracing::warn;

/// Delimiter used for ratio names and ratio values.
pub const RATIO_DELIMITER: &str = "****";
/// Delimiter used for generated questions. Distinct from any punctuation that
/// can appear inside a question.
pub const QUESTION_DELIMITER: &str = "********";

/// The model returned a different number of tokens than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for TokenCountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} tokens, model returned {}",
            self.expected, self.actual
        )
    }
}

/// Ordered, trimmed tokens plus an optional count-mismatch warning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedTokens {
    pub tokens: Vec<String>,
    pub mismatch: Option<TokenCountMismatch>,
}

impl ParsedTokens {
    fn new(tokens: Vec<String>, expected: Option<usize>) -> Self {
        let mismatch = expected.and_then(|expected| {
            (expected != tokens.len()).then_some(TokenCountMismatch {
                expected,
                actual: tokens.len(),
            })
        });
        if let Some(m) = &mismatch {
            warn!(expected = m.expected, actual = m.actual, "token count mismatch in model output");
        }
        Self { tokens, mismatch }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens with empty strings removed, order preserved.
    pub fn non_empty(&self) -> Vec<String> {
        self.tokens
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect()
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

/// Split `raw` on the literal `delimiter` and trim each token.
///
/// Input that is blank after trimming yields no tokens. An empty delimiter
/// leaves the input as a single token.
pub fn parse(raw: &str, delimiter: &str, expected: Option<usize>) -> ParsedTokens {
    if raw.trim().is_empty() {
        return ParsedTokens::new(Vec::new(), expected);
    }
    let tokens = if delimiter.is_empty() {
        vec![raw.trim().to_string()]
    } else {
        raw.split(delimiter).map(|t| t.trim().to_string()).collect()
    };
    ParsedTokens::new(tokens, expected)
}

/// Split on runs of whitespace. Only for outputs defined as space-separated
/// (ticker lists, weight lists).
pub fn parse_words(raw: &str, expected: Option<usize>) -> ParsedTokens {
    let tokens = raw.split_whitespace().map(str::to_string).collect();
    ParsedTokens::new(tokens, expected)
}

/// Coerce a token to a finite number.
pub fn to_number(token: &str) -> Option<f64> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Result of a defaulted coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coerced {
    pub value: f64,
    pub used_default: bool,
}

/// Coerce a token, falling back to `default` and reporting whether it did.
pub fn to_number_or(token: &str, default: f64) -> Coerced {
    match to_number(token) {
        Some(value) => Coerced {
            value,
            used_default: false,
        },
        None => Coerced {
            value: default,
            used_default: true,
        },
    }
}
