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

const USER_MEMORY_INSTRUCTION: &str = "你是记忆提取助手，从用户消息中提取值得长期记住的个人信息。

【提取类型与分类】
- identity: 身份（职业、学历、年龄段、性别、所在地）
- likes: 喜欢的事物（兴趣、爱好、喜欢的游戏/食物等）
- dislikes: 讨厌的事物（不喜欢的东西）
- relationship: 人际关系（感情状态、家庭成员、宠物）
- habits: 习惯（作息、饮食、行为模式）
- skills: 技能（擅长的事）
- experience: 经历/事件（重要事件）

【不要提取】
- 临时状态：今天很累、正在吃饭、刚睡醒
- 普通闲聊：哈哈、好的、emmm
- 提问内容：用户问的问题本身

【重要性评分】
- 0.9-1.0：核心身份（职业、性别、所在城市）
- 0.7-0.8：稳定喜好（长期兴趣、讨厌的事物）
- 0.5-0.6：一般信息（习惯、技能）

【输出格式】
- 用简洁的陈述句，如\"程序员\"而不是\"用户是一个程序员\"
- 返回 JSON 数组：[{\"content\": \"信息\", \"category\": \"分类\", \"importance\": 0.8}]
- category 必须是以上7个分类之一
- 无有效信息时返回 []
- 只输出 JSON，不要其他内容";

/// Fixed taxonomy for facts about a user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UserCategory {
    Identity,
    Likes,
    Dislikes,
    Relationship,
    Habits,
    Skills,
    Experience,
}

impl UserCategory {
    pub const ALL: [UserCategory; 7] = [
        UserCategory::Identity,
        UserCategory::Likes,
        UserCategory::Dislikes,
        UserCategory::Relationship,
        UserCategory::Habits,
        UserCategory::Skills,
        UserCategory::Experience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserCategory::Identity => "identity",
            UserCategory::Likes => "likes",
            UserCategory::Dislikes => "dislikes",
            UserCategory::Relationship => "relationship",
            UserCategory::Habits => "habits",
            UserCategory::Skills => "skills",
            UserCategory::Experience => "experience",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UserCategory::Identity => "用户身份",
            UserCategory::Likes => "用户喜好",
            UserCategory::Dislikes => "用户讨厌",
            UserCategory::Relationship => "用户关系",
            UserCategory::Habits => "用户习惯",
            UserCategory::Skills => "用户技能",
            UserCategory::Experience => "用户经历",
        }
    }

    /// Parse a candidate category, falling back to the catch-all for
    /// anything outside the fixed set.
    pub fn parse_or_catch_all(s: &str) -> Self {
        match s {
            "likes" => UserCategory::Likes,
            "dislikes" => UserCategory::Dislikes,
            "relationship" => UserCategory::Relationship,
            "habits" => UserCategory::Habits,
            "skills" => UserCategory::Skills,
            "experience" => UserCategory::Experience,
            _ => UserCategory::Identity,
        }
    }
}

/// Everything remembered about one user within one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMemory {
    pub categorized_facts: BTreeMap<UserCategory, Vec<MemoryFact>>,
    #[serde(default = "default_relationship", alias = "relationship")]
    pub relationship_score: f64,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

fn default_relationship() -> f64 {
    0.5
}

fn empty_categories() -> BTreeMap<UserCategory, Vec<MemoryFact>> {
    UserCategory::ALL.iter().map(|c| (*c, Vec::new())).collect()
}

impl Default for UserMemory {
    fn default() -> Self {
        Self {
            categorized_facts: empty_categories(),
            relationship_score: default_relationship(),
            nickname: None,
            last_update: Utc::now(),
        }
    }
}

impl UserMemory {
    fn ensure_categories(&mut self) {
        for category in UserCategory::ALL {
            self.categorized_facts.entry(category).or_default();
        }
    }

    pub fn total_facts(&self) -> usize {
        self.categorized_facts.values().map(Vec::len).sum()
    }
}

/// Stored record shapes across schema versions. The legacy shape carried
/// a flat fact list plus like/dislike string lists.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredUserMemory {
    Current(UserMemory),
    Legacy(LegacyUserMemory),
}

#[derive(Deserialize)]
struct LegacyUserMemory {
    #[serde(default)]
    facts: Vec<MemoryFact>,
    #[serde(default)]
    preferences: LegacyPreferences,
    #[serde(default, alias = "relationshipScore")]
    relationship: Option<f64>,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Default, Deserialize)]
struct LegacyPreferences {
    #[serde(default)]
    likes: Vec<String>,
    #[serde(default)]
    dislikes: Vec<String>,
}

impl LegacyUserMemory {
    /// Move flat facts into the catch-all category and convert old
    /// like/dislike lists into facts at importance 0.7.
    fn migrate(self) -> UserMemory {
        let mut memory = UserMemory {
            relationship_score: self.relationship.unwrap_or_else(default_relationship),
            nickname: self.nickname,
            ..UserMemory::default()
        };

        if let Some(identity) = memory.categorized_facts.get_mut(&UserCategory::Identity) {
            identity.extend(self.facts);
        }
        if let Some(likes) = memory.categorized_facts.get_mut(&UserCategory::Likes) {
            likes.extend(
                self.preferences
                    .likes
                    .into_iter()
                    .map(|content| MemoryFact::new(content, 0.7)),
            );
        }
        if let Some(dislikes) = memory.categorized_facts.get_mut(&UserCategory::Dislikes) {
            dislikes.extend(
                self.preferences
                    .dislikes
                    .into_iter()
                    .map(|content| MemoryFact::new(content, 0.7)),
            );
        }

        memory
    }
}

/// Per-(group, user) long-term memory over the persistence port.
///
/// Reads fail open to the default record; writes are logged and
/// swallowed. Decay runs on every read, so records shrink over time even
/// without explicit maintenance.
pub struct UserMemoryStore {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: KeyedLocks,
    extractor: Option<Arc<dyn CompletionPort>>,
    config: MemoryConfig,
}

impl UserMemoryStore {
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

    /// Current memory for a user, decayed and with every category present.
    pub async fn memory(&self, group_id: &str, user_id: &str) -> UserMemory {
        self.load(group_id, user_id).await
    }

    /// Add a fact, merging into a similar existing fact in the same
    /// category instead of duplicating it.
    pub async fn add_fact(
        &self,
        group_id: &str,
        user_id: &str,
        content: &str,
        importance: f64,
        category: UserCategory,
    ) {
        let key = self.keys.user_memory(group_id, user_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id, user_id).await;
        let list = memory.categorized_facts.entry(category).or_default();

        if let Some(existing) = list.iter_mut().find(|f| is_similar(&f.content, content)) {
            existing.importance = (existing.importance + SIMILAR_BUMP).min(1.0);
            existing.last_used = Utc::now();
            debug!(
                group_id,
                user_id,
                category = category.as_str(),
                content,
                "reinforced existing fact"
            );
        } else {
            list.push(MemoryFact::new(content, importance));
            info!(
                group_id,
                user_id,
                category = category.as_str(),
                content,
                importance,
                "stored new fact"
            );
        }
        sort_by_importance(list);
        trim_to_cap(&mut memory.categorized_facts, self.config.max_facts_per_user);

        self.save(group_id, user_id, &mut memory).await;
    }

    /// Shift the relationship score by `delta`, clamped to `[0,1]`.
    pub async fn update_relationship(&self, group_id: &str, user_id: &str, delta: f64) -> f64 {
        let key = self.keys.user_memory(group_id, user_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id, user_id).await;
        memory.relationship_score = (memory.relationship_score + delta).clamp(0.0, 1.0);
        self.save(group_id, user_id, &mut memory).await;
        memory.relationship_score
    }

    /// Set or clear the bot's pet name for this user.
    pub async fn set_nickname(&self, group_id: &str, user_id: &str, nickname: Option<String>) {
        let key = self.keys.user_memory(group_id, user_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id, user_id).await;
        memory.nickname = nickname;
        self.save(group_id, user_id, &mut memory).await;
    }

    /// Refresh `last_used` on the first fact matching `content` exactly,
    /// searching categories in order.
    pub async fn touch(&self, group_id: &str, user_id: &str, content: &str) {
        let key = self.keys.user_memory(group_id, user_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut memory = self.load(group_id, user_id).await;
        let mut touched = false;
        for list in memory.categorized_facts.values_mut() {
            if let Some(fact) = list.iter_mut().find(|f| f.content == content) {
                fact.last_used = Utc::now();
                touched = true;
                break;
            }
        }
        if touched {
            self.save(group_id, user_id, &mut memory).await;
        }
    }

    /// Ask the extraction port for memorable facts in the latest exchange
    /// and persist the keepers. Failures leave stored state untouched.
    pub async fn extract_and_save(
        &self,
        group_id: &str,
        user_id: &str,
        user_message: &str,
        _bot_reply: &str,
    ) {
        let Some(extractor) = &self.extractor else {
            debug!(group_id, user_id, "extraction port not configured, skipping");
            return;
        };
        if user_message.trim().is_empty() {
            return;
        }

        let prompt = format!("用户消息：{user_message}\n\n请提取值得记忆的信息：");
        let content = match extractor.complete(USER_MEMORY_INSTRUCTION, &prompt, 300).await {
            Ok(content) => content,
            Err(e) => {
                error!(group_id, user_id, %e, "memory extraction failed");
                return;
            }
        };
        let items = match extract::parse_array(&content) {
            Ok(items) => items,
            Err(e) => {
                error!(group_id, user_id, %e, "memory extraction returned malformed output");
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
                .map(UserCategory::parse_or_catch_all)
                .unwrap_or(UserCategory::Identity);
            self.add_fact(group_id, user_id, content, importance, category)
                .await;
            stored += 1;
        }
        if stored > 0 {
            info!(
                group_id,
                user_id,
                extracted = items.len(),
                stored,
                "extracted memories from exchange"
            );
        }
    }

    /// Forget everything about this user in this group.
    pub async fn clear(&self, group_id: &str, user_id: &str) {
        let key = self.keys.user_memory(group_id, user_id);
        if let Err(e) = self.store.del(&key).await {
            error!(group_id, user_id, %e, "failed to clear user memory");
        } else {
            info!(group_id, user_id, "cleared user memory");
        }
    }

    /// Memory fragment for the prompt, or empty when nothing is known.
    pub async fn prompt_for(&self, group_id: &str, user_id: &str) -> String {
        render_prompt(&self.memory(group_id, user_id).await)
    }

    async fn load(&self, group_id: &str, user_id: &str) -> UserMemory {
        let key = self.keys.user_memory(group_id, user_id);
        let mut memory = match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredUserMemory>(&raw) {
                Ok(StoredUserMemory::Current(memory)) => memory,
                Ok(StoredUserMemory::Legacy(legacy)) => {
                    info!(group_id, user_id, "migrating legacy memory record");
                    let mut migrated = legacy.migrate();
                    self.save(group_id, user_id, &mut migrated).await;
                    migrated
                }
                Err(e) => {
                    error!(group_id, user_id, %e, "discarding malformed memory record");
                    UserMemory::default()
                }
            },
            Ok(None) => UserMemory::default(),
            Err(e) => {
                error!(group_id, user_id, %e, "memory read failed");
                UserMemory::default()
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

    async fn save(&self, group_id: &str, user_id: &str, memory: &mut UserMemory) {
        memory.last_update = Utc::now();
        let key = self.keys.user_memory(group_id, user_id);
        match serde_json::to_string(memory) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw, MEMORY_TTL_SECS).await {
                    error!(group_id, user_id, %e, "memory write failed");
                }
            }
            Err(e) => error!(group_id, user_id, %e, "memory encode failed"),
        }
    }
}

/// Render a user memory into its prompt fragment: one line per non-empty
/// category, plus nickname and a relationship band when they apply.
pub fn render_prompt(memory: &UserMemory) -> String {
    let mut parts = Vec::new();

    for category in UserCategory::ALL {
        let Some(facts) = memory.categorized_facts.get(&category) else {
            continue;
        };
        if facts.is_empty() {
            continue;
        }
        let top = top_contents(facts, PROMPT_FACTS_PER_CATEGORY);
        parts.push(format!("【{}】{}", category.label(), top.join("、")));
    }

    if let Some(nickname) = &memory.nickname {
        parts.push(format!("【你给TA起的昵称】{nickname}"));
    }

    if memory.relationship_score >= 0.8 {
        parts.push("你们关系很好，是老朋友了".to_string());
    } else if memory.relationship_score <= 0.3 {
        parts.push("你们不太熟，保持礼貌".to_string());
    }

    parts.join("\n")
}
