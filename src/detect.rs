//! Character-level detection of untranslated Chinese residue.

/// Full-width punctuation that only appears in Chinese typography. ASCII
/// punctuation never matches. Curly quotes are deliberately absent: English
/// typesetting uses them too.
pub const CHINESE_PUNCTUATION: [char; 19] = [
    '\u{FF0C}', // ，
    '\u{3002}', // 。
    '\u{3001}', // 、
    '\u{FF1A}', // ：
    '\u{FF1B}', // ；
    '\u{FF01}', // ！
    '\u{FF1F}', // ？
    '\u{FF08}', // （
    '\u{FF09}', // ）
    '\u{3010}', // 【
    '\u{3011}', // 】
    '\u{FF3B}', // ［
    '\u{FF3D}', // ］
    '\u{300A}', // 《
    '\u{300B}', // 》
    '\u{300C}', // 「
    '\u{300D}', // 」
    '\u{2026}', // …
    '\u{FF5E}', // ～
];

/// Bibliographic labels that mark leftover Chinese front/back matter. The
/// DOI/CSTR entries carry a full-width colon so the English "DOI:" never
/// matches.
pub const CHINESE_METADATA_MARKERS: [&str; 16] = [
    "作者",
    "通信作者",
    "收稿日期",
    "修回日期",
    "摘要",
    "关键词",
    "中图分类号",
    "文献标志码",
    "基金项目",
    "引用格式",
    "参考文献",
    "版本历史",
    "全文下载",
    "文章来源",
    "DOI：",
    "CSTR：",
];

#[must_use]
pub fn is_chinese_ideograph(ch: char) -> bool {
    let u = ch as u32;
    (0x3400..=0x4DBF).contains(&u)
        || (0x4E00..=0x9FFF).contains(&u)
        || (0xF900..=0xFAFF).contains(&u)
        || (0x20000..=0x2A6DF).contains(&u)
        || (0x2A700..=0x2B73F).contains(&u)
        || (0x2B740..=0x2B81F).contains(&u)
        || (0x2B820..=0x2CEAF).contains(&u)
        || (0x2CEB0..=0x2EBEF).contains(&u)
}

#[must_use]
pub fn is_chinese_char(ch: char) -> bool {
    is_chinese_ideograph(ch) || CHINESE_PUNCTUATION.contains(&ch)
}

#[must_use]
pub fn has_chinese_metadata(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    CHINESE_METADATA_MARKERS.iter().any(|m| text.contains(m))
}

/// Fraction of characters that are Chinese ideographs or Chinese punctuation.
#[must_use]
pub fn calculate_chinese_ratio(text: &str) -> f64 {
    char_ratio(text, is_chinese_char)
}

/// Fraction of characters that are Chinese ideographs, punctuation excluded.
/// Distinguishes "still has real Chinese words" from stray full-width marks.
#[must_use]
pub fn calculate_chinese_ideograph_ratio(text: &str) -> f64 {
    char_ratio(text, is_chinese_ideograph)
}

fn char_ratio(text: &str, pred: fn(char) -> bool) -> f64 {
    let mut total = 0usize;
    let mut hits = 0usize;
    for ch in text.chars() {
        total += 1;
        if pred(ch) {
            hits += 1;
        }
    }
    hits as f64 / total.max(1) as f64
}

/// Distinct Chinese characters in order of first appearance, for review output.
#[must_use]
pub fn chinese_chars_in(text: &str) -> Vec<char> {
    let mut seen: std::collections::HashSet<char> = std::collections::HashSet::new();
    let mut out: Vec<char> = Vec::new();
    for ch in text.chars() {
        if is_chinese_char(ch) && seen.insert(ch) {
            out.push(ch);
        }
    }
    out
}
