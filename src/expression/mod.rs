pub mod tokens;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::ExpressionConfig;
use crate::extract::{self, CompletionPort, ExtractError};
use crate::store::{KeyedLocks, Keyspace, KvStore};

/// Sliding TTL for stored expression profiles.
const EXPRESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
/// Frequency tables update on every Nth message, not every message.
const WORD_UPDATE_EVERY: u64 = 5;
const MAX_EMOJIS: usize = 20;
const MAX_SCENARIOS: usize = 10;
const MAX_SCENARIO_EXPRESSIONS: usize = 6;
/// At most this many buffered messages go into one AI learning sample.
const AI_SAMPLE_MESSAGES: usize = 100;

const STYLE_INSTRUCTION: &str = "分析以下群聊消息样本，提取群友的表达习惯。

【任务】
归纳群友在不同情境下的常用表达方式，只提取有特色的、非通用的表达。

【输出格式】
返回 JSON 数组：
[
  {\"situation\": \"表示赞叹\", \"expressions\": [\"绝绝子\", \"yyds\"]},
  {\"situation\": \"表示无语\", \"expressions\": [\"笑死\", \"绷不住\"]}
]

【注意】
- situation 用简短的中文描述（4-8字）
- expressions 只提取群里实际出现的词/短语
- 不要提取通用词（好、行、嗯、哦等）
- 最多返回 5 个场景
- 无明显规律时返回 []
- 只输出 JSON，不要其他内容";

/// One AI-learned "situation → expressions" scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleScenario {
    pub situation: String,
    pub expressions: Vec<String>,
    #[serde(default)]
    pub count: u32,
}

/// Per-group linguistic style: word/emoji frequencies, sentence-pattern
/// tags, and AI-learned scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpressionProfile {
    pub words: HashMap<String, u32>,
    pub emojis: HashMap<String, u32>,
    pub patterns: Vec<String>,
    pub style_expressions: Vec<StyleScenario>,
    pub message_count: u64,
    #[serde(rename = "lastAiLearnTime", with = "chrono::serde::ts_milliseconds")]
    pub last_ai_learn: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

impl Default for ExpressionProfile {
    fn default() -> Self {
        Self {
            words: HashMap::new(),
            emojis: HashMap::new(),
            patterns: Vec::new(),
            style_expressions: Vec::new(),
            message_count: 0,
            last_ai_learn: DateTime::<Utc>::UNIX_EPOCH,
            last_update: Utc::now(),
        }
    }
}

/// Learns how a group talks.
///
/// Frequency tables update synchronously on a fixed message cadence; AI
/// scenario learning runs as a spawned background task once enough raw
/// messages have been buffered. Counters and buffers are process-local
/// and reset on restart — a crash loses at most one buffer's worth.
pub struct ExpressionLearner {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: KeyedLocks,
    extractor: Option<Arc<dyn CompletionPort>>,
    config: ExpressionConfig,
    blocked: Mutex<HashSet<String>>,
    counters: Mutex<HashMap<String, u64>>,
    pending: Mutex<HashMap<String, Vec<String>>>,
}

impl ExpressionLearner {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        extractor: Option<Arc<dyn CompletionPort>>,
        config: ExpressionConfig,
    ) -> Self {
        let blocked = config.blocked_words.iter().cloned().collect();
        Self {
            store,
            keys,
            locks: KeyedLocks::new(),
            extractor,
            config,
            blocked: Mutex::new(blocked),
            counters: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one inbound message into the group's style state.
    pub async fn update(self: &Arc<Self>, group_id: &str, text: &str) {
        let count = {
            let mut counters = self.counters.lock().await;
            let counter = counters.entry(group_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        if self.config.ai_learning_enabled && !text.is_empty() {
            let mut pending = self.pending.lock().await;
            let buffer = pending.entry(group_id.to_string()).or_default();
            buffer.push(text.to_string());
            if buffer.len() > self.config.ai_learning_message_threshold {
                buffer.remove(0);
            }
        }

        if count % WORD_UPDATE_EVERY == 0 {
            self.learn_frequencies(group_id, text).await;
        }

        if self.config.ai_learning_enabled && self.extractor.is_some() {
            let sample = {
                let mut pending = self.pending.lock().await;
                let buffer = pending.entry(group_id.to_string()).or_default();
                if buffer.len() >= self.config.ai_learning_message_threshold {
                    std::mem::take(buffer)
                } else {
                    Vec::new()
                }
            };

            if !sample.is_empty() {
                let learner = Arc::clone(self);
                let group = group_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = learner.learn_style(&group, sample).await {
                        warn!(group_id = %group, %e, "AI style learning failed");
                    }
                });
            }
        }
    }

    /// Current profile for a group.
    pub async fn profile(&self, group_id: &str) -> ExpressionProfile {
        self.load(group_id).await
    }

    /// Extend the runtime blocklist.
    pub async fn add_blocked_words<I: IntoIterator<Item = String>>(&self, words: I) {
        let mut blocked = self.blocked.lock().await;
        blocked.extend(words);
    }

    /// Ask the extraction port to distill scenario expressions from a
    /// message sample and merge the result into the stored profile.
    ///
    /// Normally triggered internally when the message buffer fills.
    pub async fn learn_style(
        &self,
        group_id: &str,
        messages: Vec<String>,
    ) -> Result<(), ExtractError> {
        let Some(extractor) = &self.extractor else {
            return Ok(());
        };

        let kept: Vec<&str> = messages
            .iter()
            .map(String::as_str)
            .filter(|m| (2..200).contains(&m.chars().count()))
            .collect();
        let kept = if kept.len() > AI_SAMPLE_MESSAGES {
            &kept[kept.len() - AI_SAMPLE_MESSAGES..]
        } else {
            &kept[..]
        };
        let sample = kept.join("\n");
        if sample.is_empty() {
            return Ok(());
        }

        let content = extractor
            .complete(STYLE_INSTRUCTION, &format!("群聊消息样本：\n{sample}"), 400)
            .await?;
        let items = extract::parse_array(&content)?;

        let scenarios: Vec<StyleScenario> = items
            .into_iter()
            .filter_map(|item| {
                let situation = item.get("situation")?.as_str()?.to_string();
                let expressions: Vec<String> = item
                    .get("expressions")?
                    .as_array()?
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect();
                if situation.is_empty() || expressions.is_empty() {
                    return None;
                }
                Some(StyleScenario {
                    situation,
                    expressions,
                    count: 1,
                })
            })
            .collect();
        if scenarios.is_empty() {
            return Ok(());
        }

        let key = self.keys.expression(group_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut profile = self.load(group_id).await;
        let learned = scenarios.len();
        for scenario in scenarios {
            merge_scenario(&mut profile.style_expressions, scenario);
        }
        profile
            .style_expressions
            .sort_by(|a, b| b.count.cmp(&a.count));
        profile.style_expressions.truncate(MAX_SCENARIOS);
        profile.last_ai_learn = Utc::now();
        self.save(group_id, &mut profile).await;

        info!(group_id, learned, "merged AI style scenarios");
        Ok(())
    }

    /// Tone/style hint for the group, or empty when nothing qualifies.
    pub async fn prompt_for_group(&self, group_id: &str) -> String {
        self.render_prompt(&self.profile(group_id).await)
    }

    /// Render a profile into the style fragment. Scenario expressions win
    /// over raw frequency tables when present.
    pub fn render_prompt(&self, profile: &ExpressionProfile) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !profile.style_expressions.is_empty() {
            let lines: Vec<String> = profile
                .style_expressions
                .iter()
                .take(5)
                .map(|s| {
                    let quoted: Vec<String> =
                        s.expressions.iter().map(|e| format!("\"{e}\"")).collect();
                    format!("- {}时，群友常说{}", s.situation, quoted.join("、"))
                })
                .collect();
            parts.push(format!("【群聊表达风格】\n{}", lines.join("\n")));
        } else {
            let mut frequent: Vec<(&String, &u32)> = profile
                .words
                .iter()
                .filter(|(_, count)| **count >= self.config.min_word_frequency)
                .collect();
            frequent.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let top: Vec<&str> = frequent
                .into_iter()
                .take(10)
                .map(|(word, _)| word.as_str())
                .collect();
            if !top.is_empty() {
                parts.push(format!("【群里常用词】{}", top.join("、")));
            }

            if !profile.patterns.is_empty() {
                let pats: Vec<&str> = profile
                    .patterns
                    .iter()
                    .take(5)
                    .map(String::as_str)
                    .collect();
                parts.push(format!("【常见句式】{}", pats.join("、")));
            }
        }

        let mut emojis: Vec<(&String, &u32)> = profile.emojis.iter().collect();
        emojis.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top_emojis: Vec<&str> = emojis
            .into_iter()
            .take(5)
            .map(|(emoji, _)| emoji.as_str())
            .collect();
        if !top_emojis.is_empty() {
            parts.push(format!("【常用表情】{}", top_emojis.concat()));
        }

        if !parts.is_empty() {
            parts.push("适当使用这些表达方式让回复更自然，但不要生硬堆砌".to_string());
        }

        parts.join("\n")
    }

    async fn learn_frequencies(&self, group_id: &str, text: &str) {
        let key = self.keys.expression(group_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut profile = self.load(group_id).await;
        profile.message_count += WORD_UPDATE_EVERY;

        let words = {
            let blocked = self.blocked.lock().await;
            tokens::extract_words(text, &blocked)
        };
        for word in words {
            *profile.words.entry(word).or_insert(0) += 1;
        }
        for emoji in tokens::extract_emojis(text) {
            *profile.emojis.entry(emoji).or_insert(0) += 1;
        }
        for tag in tokens::extract_patterns(text) {
            if !profile.patterns.iter().any(|p| p == tag) {
                profile.patterns.push(tag.to_string());
            }
        }

        if profile.words.len() > self.config.max_words * 2 {
            profile.words = top_n(&profile.words, self.config.max_words);
        }
        if profile.emojis.len() > MAX_EMOJIS {
            profile.emojis = top_n(&profile.emojis, MAX_EMOJIS);
        }

        self.save(group_id, &mut profile).await;
    }

    async fn load(&self, group_id: &str) -> ExpressionProfile {
        let key = self.keys.expression(group_id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(profile) => profile,
                Err(e) => {
                    error!(group_id, %e, "discarding malformed expression profile");
                    ExpressionProfile::default()
                }
            },
            Ok(None) => ExpressionProfile::default(),
            Err(e) => {
                error!(group_id, %e, "expression profile read failed");
                ExpressionProfile::default()
            }
        }
    }

    async fn save(&self, group_id: &str, profile: &mut ExpressionProfile) {
        profile.last_update = Utc::now();
        let key = self.keys.expression(group_id);
        match serde_json::to_string(profile) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw, EXPRESSION_TTL_SECS).await {
                    error!(group_id, %e, "expression profile write failed");
                }
            }
            Err(e) => error!(group_id, %e, "expression profile encode failed"),
        }
    }
}

/// Merge one learned scenario: union expressions into an existing entry
/// with the same situation, or append a fresh entry.
fn merge_scenario(existing: &mut Vec<StyleScenario>, new: StyleScenario) {
    if let Some(slot) = existing
        .iter_mut()
        .find(|s| s.situation == new.situation)
    {
        for expression in new.expressions {
            if !slot.expressions.contains(&expression) {
                slot.expressions.push(expression);
            }
        }
        slot.expressions.truncate(MAX_SCENARIO_EXPRESSIONS);
        slot.count += 1;
    } else {
        let mut new = new;
        new.expressions.truncate(MAX_SCENARIO_EXPRESSIONS);
        existing.push(new);
    }
}

/// Keep the top `n` entries of a frequency table, highest counts first,
/// ties broken lexically for determinism.
fn top_n(counts: &HashMap<String, u32>, n: usize) -> HashMap<String, u32> {
    let mut entries: Vec<(&String, &u32)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(n)
        .map(|(word, count)| (word.clone(), *count))
        .collect()
}
