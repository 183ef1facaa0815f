//! Token, emoji, and sentence-pattern extraction from raw chat messages.

use std::collections::HashSet;
use std::sync::OnceLock;

/// Filler words and platform-format noise that say nothing about a
/// group's style.
const STOP_WORDS: &[&str] = &[
    "的", "是", "了", "在", "我", "你", "他", "她", "它", "们", "有", "和", "与", "这", "那",
    "就", "也", "都", "而", "及", "着", "或", "一个", "没有", "不是", "什么", "怎么", "为什么",
    "可以", "能", "会", "要", "想", "去", "来", "到", "从", "把", "被", "让", "给", "对", "说",
    "看", "做", "用", "很", "太", "吗", "呢", "吧", "啊", "哦", "嗯", "呀", "哈", "嘿", "哎",
    "好", "行", "是的", "不", "没", "别", "请", "谢谢", "qq", "member", "admin", "owner", "id",
    "消息", "群身份", "在群里", "群里说", "回复了", "艾特了", "发送了", "一张图片", "张图片",
    "表情", "发送了表情",
];

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&ch)
}

/// Membership in the common Unicode emoji blocks.
fn is_emoji(ch: char) -> bool {
    matches!(ch, '\u{1F300}'..='\u{1F9FF}' | '\u{2600}'..='\u{26FF}' | '\u{2700}'..='\u{27BF}')
}

/// Drop URLs, @mentions, and bracketed platform markup before tokenizing.
fn strip_noise(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(ch) = rest.chars().next() {
        if rest.starts_with("http://") || rest.starts_with("https://") || ch == '@' {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            rest = &rest[end..];
        } else if ch == '[' {
            match rest.find(']') {
                Some(end) => rest = &rest[end + 1..],
                None => {
                    out.push('[');
                    rest = &rest[1..];
                }
            }
        } else {
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }

    out
}

/// Split a maximal character run into chunks of at most `max`, keeping
/// chunks of at least `min`.
fn flush_run(run: &[char], min: usize, max: usize, out: &mut Vec<String>) {
    let mut i = 0;
    while run.len() - i >= min {
        let take = (run.len() - i).min(max);
        out.push(run[i..i + take].iter().collect());
        i += take;
    }
}

fn collect_runs(
    text: &str,
    pred: impl Fn(char) -> bool,
    min: usize,
    max: usize,
    fold: bool,
    out: &mut Vec<String>,
) {
    let mut run: Vec<char> = Vec::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if pred(ch) {
            run.push(if fold { ch.to_ascii_lowercase() } else { ch });
        } else if !run.is_empty() {
            flush_run(&run, min, max, out);
            run.clear();
        }
    }
}

/// Collect style-bearing tokens from one message: CJK runs of 2-6
/// characters, alphabetic runs of 2-10, and alphanumeric slang runs of
/// 2-6, minus stop words, blocked words, and pure numbers.
pub fn extract_words(text: &str, blocked: &HashSet<String>) -> Vec<String> {
    let text = strip_noise(text);
    let mut words = Vec::new();

    collect_runs(&text, is_cjk, 2, 6, false, &mut words);
    collect_runs(&text, |c| c.is_ascii_alphabetic(), 2, 10, true, &mut words);
    collect_runs(&text, |c| c.is_ascii_alphanumeric(), 2, 6, true, &mut words);

    words.retain(|word| {
        !stop_words().contains(word.as_str())
            && !blocked.contains(word)
            && !word.chars().all(|c| c.is_ascii_digit())
            && word.chars().count() >= 2
    });
    words
}

/// Every emoji occurrence in the message, not deduplicated.
pub fn extract_emojis(text: &str) -> Vec<String> {
    text.chars()
        .filter(|c| is_emoji(*c))
        .map(|c| c.to_string())
        .collect()
}

/// Match a message against the fixed set of sentence-pattern tags.
/// A message can contribute several tags; each appears at most once.
pub fn extract_patterns(text: &str) -> Vec<&'static str> {
    let mut tags = Vec::new();

    if text.contains("...") {
        tags.push("...");
    }
    if text.ends_with('吧') {
        tags.push("...吧");
    }
    if text.ends_with('啊') {
        tags.push("...啊");
    }
    if text.ends_with('呢') {
        tags.push("...呢");
    }
    if text.contains("哈哈") {
        tags.push("哈哈");
    }
    if text.contains("笑死") {
        tags.push("笑死");
    }
    if text.contains("啊这") {
        tags.push("啊这");
    }
    if text.contains("无语") {
        tags.push("无语");
    }
    if text.contains("绝了") {
        tags.push("绝了");
    }
    if text.contains("真的假的") {
        tags.push("真的假的");
    }
    if text.contains("确实") {
        tags.push("确实");
    }
    if text.contains("属于是") {
        tags.push("属于是");
    }

    tags
}
