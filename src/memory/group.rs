use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{
    EXTRACTION_MIN_IMPORTANCE, MEMORY_TTL_SECS, MemoryFact, PROMPT_FACTS_PER_CATEGORY,
    SIMILAR_BUMP, decay_map, is_similar, sort_by_importance, top_contents, trim_to_cap,
};
use crate::config::MemoryConfig;
use crate::extract::{self, CompletionPort};
use crate::store::{KeyedLocks, Keyspace, KvStore};

const GROUP_MEMORY_INSTRUCTION: &str = "你是群聊记忆提取助手，从群聊消息中提取值得群体长期记住的信息。

【提取类型与分类】
- topic: 群里经常讨论的话题
- rule: 群规或群内约定
- meme: 群里流行的梗、玩笑
- event: 群里发生的重要事件
- member: 关于群成员的公开信息

【不要提取】
- 临时状态或一次性闲聊
- 与群体无关的私人隐私

【重要性评分】
- 0.9-1.0：群规、长期有效的约定
- 0.7-0.8：反复出现的话题、流行的梗
- 0.5-0.6：一般事件、成员信息

【输出格式】
- 用简洁的陈述句描述
- 返回 JSON 数组：[{\"content\": \"信息\", \"category\": \"分类\", \"importance\": 0.8}]
- category 必须是以上5个分类之一
- 无有效信息时返回 []
- 只输出 JSON，不要其他内容";

/// Fixed taxonomy for facts about a group as a whole.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum GroupCategory {
    Topic,
    Rule,
    Meme,
    Event,
    Member,
}

impl GroupCategory {
    pub const ALL: [GroupCategory; 5] = [
        GroupCategory::Topic,
        GroupCategory::Rule,
        GroupCategory::Meme,
        GroupCategory::Event,
        GroupCategory::Member,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupCategory::Topic => "topic",
            GroupCategory::Rule => "rule",
            GroupCategory::Meme => "meme",
            GroupCategory::Event => "event",
            GroupCategory::Member => "member",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GroupCategory::Topic => "群内话题",
            GroupCategory::Rule => "群规矩",
            GroupCategory::Meme => "群内梗",
            GroupCategory::Event => "群内事件",
            GroupCategory::Member => "群成员",
        }
    }

    /// Parse a candidate category, falling back to the catch-all for
    /// anything outside the fixed set.
    pub fn parse_or_catch_all(s: &str) -> Self {
        match s {
            "rule" => GroupCategory::Rule,
            "meme" => GroupCategory::Meme,
            "event" => GroupCategory::Event,
            "member" => GroupCategory::Member,
            _ => GroupCategory::Topic,
        }
    }
}

/// Everything remembered about one group collectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemory {
    pub categorized_facts: BTreeMap<GroupCategory, Vec<MemoryFact>>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

fn empty_categories() -> BTreeMap<GroupCategory, Vec<MemoryFact>> {
    GroupCategory::ALL.iter().map(|c| (*c, Vec::new())).collect()
}

impl Default for GroupMemory {
    fn default() -> Self {
        Self {
            categorized_facts: empty_categories(),
            last_update: Utc::now(),
        }
    }
}

impl GroupMemory {
    fn ensure_categories(&mut self) {
        for category in GroupCategory::ALL {
            self.categorized_facts.entry(category).or_default();
        }
    }

    pub fn total_facts(&self) -> usize {
        self.categorized_facts.values().map(Vec::len).sum()
    }
}

/// Per-group collective memory over the persistence port. Mirrors the
/// user scope minus relationship score and nickname.
pub struct GroupMemoryStore {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: KeyedLocks,
    extractor: Option<Arc<dyn CompletionPort>>,
    config: MemoryConfig,
}

impl GroupMemoryStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        extractor: Option<Arc<dyn CompletionPort>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            keys,
            locks: KeyedLocks::new(),
            extractor,
            config,
        }
    }

    /// Current memory for a group, decayed and with every category present.
    pub async fn memory(&self, group_id: &str) -> GroupMemory {
        self.load(group_id).await
    }

    /// Add a fact, merging into a similar existing fact in the same
    /// category instead of duplicating it.
    pub async fn add_fact(
        &self,
        group_id: &str,
        content: &str,
        importance: f64,
        category: GroupCategory,
    ) {
        let key = self.keys.group_memory(group_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id).await;
        let list = memory.categorized_facts.entry(category).or_default();

        if let Some(existing) = list.iter_mut().find(|f| is_similar(&f.content, content)) {
            existing.importance = (existing.importance + SIMILAR_BUMP).min(1.0);
            existing.last_used = Utc::now();
            debug!(
                group_id,
                category = category.as_str(),
                content,
                "reinforced existing group fact"
            );
        } else {
            list.push(MemoryFact::new(content, importance));
            info!(
                group_id,
                category = category.as_str(),
                content,
                importance,
                "stored new group fact"
            );
        }
        sort_by_importance(list);
        trim_to_cap(&mut memory.categorized_facts, self.config.max_facts_per_group);

        self.save(group_id, &mut memory).await;
    }

    /// Refresh `last_used` on the first fact matching `content` exactly.
    pub async fn touch(&self, group_id: &str, content: &str) {
        let key = self.keys.group_memory(group_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id).await;
        let mut touched = false;
        for list in memory.categorized_facts.values_mut() {
            if let Some(fact) = list.iter_mut().find(|f| f.content == content) {
                fact.last_used = Utc::now();
                touched = true;
                break;
            }
        }
        if touched {
            self.save(group_id, &mut memory).await;
        }
    }

    /// Ask the extraction port for group-memorable facts in one speaker's
    /// message and persist the keepers. Failures leave state untouched.
    pub async fn extract_and_save(&self, group_id: &str, display_name: &str, message: &str) {
        let Some(extractor) = &self.extractor else {
            debug!(group_id, "extraction port not configured, skipping");
            return;
        };
        if message.trim().is_empty() {
            return;
        }

        let prompt = format!("群成员「{display_name}」说：{message}\n\n请提取值得记忆的信息：");
        let content = match extractor
            .complete(GROUP_MEMORY_INSTRUCTION, &prompt, 300)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                error!(group_id, %e, "group memory extraction failed");
                return;
            }
        };
        let items = match extract::parse_array(&content) {
            Ok(items) => items,
            Err(e) => {
                error!(group_id, %e, "group memory extraction returned malformed output");
                return;
            }
        };

        let mut stored = 0usize;
        for item in &items {
            let Some(content) = item.get("content").and_then(|v| v.as_str()) else {
                continue;
            };
            let importance = item
                .get("importance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if importance < EXTRACTION_MIN_IMPORTANCE {
                continue;
            }
            let category = item
                .get("category")
                .and_then(|v| v.as_str())
                .map(GroupCategory::parse_or_catch_all)
                .unwrap_or(GroupCategory::Topic);
            self.add_fact(group_id, content, importance, category).await;
            stored += 1;
        }
        if stored > 0 {
            info!(
                group_id,
                extracted = items.len(),
                stored,
                "extracted group memories"
            );
        }
    }

    /// Forget everything remembered about this group.
    pub async fn clear(&self, group_id: &str) {
        let key = self.keys.group_memory(group_id);
        if let Err(e) = self.store.del(&key).await {
            error!(group_id, %e, "failed to clear group memory");
        } else {
            info!(group_id, "cleared group memory");
        }
    }

    /// Memory fragment for the prompt, or empty when nothing is known.
    pub async fn prompt_for(&self, group_id: &str) -> String {
        render_prompt(&self.memory(group_id).await)
    }

    async fn load(&self, group_id: &str) -> GroupMemory {
        let key = self.keys.group_memory(group_id);
        let mut memory = match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(memory) => memory,
                Err(e) => {
                    error!(group_id, %e, "discarding malformed group memory record");
                    GroupMemory::default()
                }
            },
            Ok(None) => GroupMemory::default(),
            Err(e) => {
                error!(group_id, %e, "group memory read failed");
                GroupMemory::default()
            }
        };

        memory.ensure_categories();
        decay_map(
            &mut memory.categorized_facts,
            Utc::now(),
            self.config.memory_decay_days,
            self.config.importance_threshold,
        );
        memory
    }

    async fn save(&self, group_id: &str, memory: &mut GroupMemory) {
        memory.last_update = Utc::now();
        let key = self.keys.group_memory(group_id);
        match serde_json::to_string(memory) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw, MEMORY_TTL_SECS).await {
                    error!(group_id, %e, "group memory write failed");
                }
            }
            Err(e) => error!(group_id, %e, "group memory encode failed"),
        }
    }
}

/// Render a group memory into its prompt fragment: one line per
/// non-empty category.
pub fn render_prompt(memory: &GroupMemory) -> String {
    let mut parts = Vec::new();

    for category in GroupCategory::ALL {
        let Some(facts) = memory.categorized_facts.get(&category) else {
            continue;
        };
        if facts.is_empty() {
            continue;
        }
        let top = top_contents(facts, PROMPT_FACTS_PER_CATEGORY);
        parts.push(format!("【{}】{}", category.label(), top.join("、")));
    }

    parts.join("\n")
}
