use once_cell::sync::Lazy;
use regex::Regex;

pub const MATH_ID_WIDTH: usize = 4;

pub const MATH_OPEN: char = '\u{27EA}'; // ⟪
pub const MATH_CLOSE: char = '\u{27EB}'; // ⟫

pub fn math_token(math_id: usize) -> String {
    format!("{MATH_OPEN}MATH_{math_id:0MATH_ID_WIDTH$}{MATH_CLOSE}")
}

pub static ANY_MATH_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\u{27EA}MATH_\d{4}\u{27EB}").expect("math token regex"));

// Broader than ANY_MATH_TOKEN_RE: catches mangled ids the model produced from a
// real token (e.g. dropped digits), which must also block publication.
pub static ANY_MATHLIKE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\u{27EA}MATH[_\-]?\d{0,8}\u{27EB}").expect("mathlike token regex"));

pub fn math_tokens_in(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }
    ANY_MATHLIKE_TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn strip_math_tokens(text: &str) -> String {
    ANY_MATHLIKE_TOKEN_RE.replace_all(text, " ").into_owned()
}
