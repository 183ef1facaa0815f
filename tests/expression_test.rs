use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use rapport::config::ExpressionConfig;
use rapport::expression::{ExpressionLearner, ExpressionProfile};
use rapport::extract::{CompletionPort, ExtractError};
use rapport::store::{Keyspace, MemoryStore};

/// Test double that replays a canned completion and records every call.
struct ScriptedPort {
    reply: String,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedPort {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl CompletionPort for ScriptedPort {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        _max_tokens: u32,
    ) -> Result<String, ExtractError> {
        self.calls
            .lock()
            .await
            .push((system.to_string(), user.to_string()));
        Ok(self.reply.clone())
    }
}

struct FailingPort;

#[async_trait::async_trait]
impl CompletionPort for FailingPort {
    async fn complete(
        &self,
        _system: &str,
        _user: &str,
        _max_tokens: u32,
    ) -> Result<String, ExtractError> {
        Err(ExtractError::Status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}

fn learner_with(
    config: ExpressionConfig,
    port: Option<Arc<dyn CompletionPort>>,
) -> Arc<ExpressionLearner> {
    Arc::new(ExpressionLearner::new(
        Arc::new(MemoryStore::new()),
        Keyspace::new("test"),
        port,
        config,
    ))
}

fn learner() -> Arc<ExpressionLearner> {
    learner_with(ExpressionConfig::default(), None)
}

// =============================================================
// Frequency learning cadence
// =============================================================

#[tokio::test]
async fn frequencies_update_on_every_fifth_message() {
    let learner = learner();

    for _ in 0..4 {
        learner.update("g1", "东京 不错哦").await;
    }
    let profile = learner.profile("g1").await;
    assert_eq!(profile.message_count, 0);
    assert!(profile.words.is_empty());

    learner.update("g1", "滑雪 好玩吗😂").await;
    let profile = learner.profile("g1").await;
    assert_eq!(profile.message_count, 5);
    // only the fifth message itself is tokenized
    assert!(profile.words.contains_key("滑雪"));
    assert!(!profile.words.contains_key("东京"));
    assert_eq!(profile.emojis.get("😂"), Some(&1));
}

#[tokio::test]
async fn patterns_collect_once_per_tag() {
    let learner = learner();
    for _ in 0..10 {
        learner.update("g1", "笑死 这也太绝了吧").await;
    }
    let profile = learner.profile("g1").await;
    assert_eq!(
        profile
            .patterns
            .iter()
            .filter(|p| p.as_str() == "笑死")
            .count(),
        1
    );
}

#[tokio::test]
async fn word_table_compacts_past_double_cap() {
    let config = ExpressionConfig {
        max_words: 3,
        ..ExpressionConfig::default()
    };
    let learner = learner_with(config, None);

    // distinct words across several extraction rounds
    let messages = ["苹果 香蕉", "樱桃 榴莲", "葡萄 蜜瓜", "柠檬 芒果"];
    for message in messages {
        for _ in 0..5 {
            learner.update("g1", message).await;
        }
    }

    let profile = learner.profile("g1").await;
    assert!(
        profile.words.len() <= 6,
        "expected trim at 2x cap, got {}",
        profile.words.len()
    );
}

// =============================================================
// AI scenario learning
// =============================================================

#[tokio::test]
async fn learn_style_merges_scenarios() {
    let port = ScriptedPort::new(r#"[{"situation":"表示赞叹","expressions":["绝绝子","yyds"]}]"#);
    let learner = learner_with(ExpressionConfig::default(), Some(port.clone()));

    learner
        .learn_style("g1", vec!["今晚开黑吗".into(), "绝绝子".into()])
        .await
        .unwrap();

    let profile = learner.profile("g1").await;
    assert_eq!(profile.style_expressions.len(), 1);
    assert_eq!(profile.style_expressions[0].situation, "表示赞叹");
    assert_eq!(profile.style_expressions[0].count, 1);

    // same situation again: expressions union, count bumps
    learner
        .learn_style("g1", vec!["还是绝绝子".into(), "yyds啊".into()])
        .await
        .unwrap();
    let profile = learner.profile("g1").await;
    assert_eq!(profile.style_expressions.len(), 1);
    assert_eq!(profile.style_expressions[0].count, 2);
    assert_eq!(
        profile.style_expressions[0].expressions,
        vec!["绝绝子".to_string(), "yyds".to_string()]
    );
}

#[tokio::test]
async fn scenario_and_expression_caps_hold() {
    let scenarios: Vec<String> = (0..12)
        .map(|i| {
            format!(
                r#"{{"situation":"场景{i}","expressions":["a{i}","b{i}","c{i}","d{i}","e{i}","f{i}","g{i}","h{i}"]}}"#
            )
        })
        .collect();
    let reply = format!("[{}]", scenarios.join(","));
    let port = ScriptedPort::new(&reply);
    let learner = learner_with(ExpressionConfig::default(), Some(port));

    learner
        .learn_style("g1", vec!["看看样本".into()])
        .await
        .unwrap();

    let profile = learner.profile("g1").await;
    assert!(profile.style_expressions.len() <= 10);
    for scenario in &profile.style_expressions {
        assert!(scenario.expressions.len() <= 6);
    }
}

#[tokio::test]
async fn learn_style_skips_trivial_sample() {
    let port = ScriptedPort::new("[]");
    let learner = learner_with(ExpressionConfig::default(), Some(port.clone()));

    // every message too short or too long to count
    let long = "啊".repeat(250);
    learner
        .learn_style("g1", vec!["x".into(), long])
        .await
        .unwrap();

    assert!(port.calls.lock().await.is_empty());
}

#[tokio::test]
async fn learn_style_abandons_malformed_output() {
    let port = ScriptedPort::new("抱歉，我帮不了你");
    let learner = learner_with(ExpressionConfig::default(), Some(port));

    let result = learner.learn_style("g1", vec!["正常消息".into()]).await;
    assert!(result.is_err());
    assert!(learner.profile("g1").await.style_expressions.is_empty());
}

#[tokio::test]
async fn learn_style_abandons_http_failure() {
    let learner = learner_with(ExpressionConfig::default(), Some(Arc::new(FailingPort)));

    let result = learner.learn_style("g1", vec!["正常消息".into()]).await;
    assert!(result.is_err());
    assert!(learner.profile("g1").await.style_expressions.is_empty());
}

#[tokio::test]
async fn buffer_threshold_triggers_background_learning() {
    let port = ScriptedPort::new(r#"[{"situation":"表示无语","expressions":["绷不住"]}]"#);
    let config = ExpressionConfig {
        ai_learning_message_threshold: 3,
        ..ExpressionConfig::default()
    };
    let learner = learner_with(config, Some(port.clone()));

    learner.update("g1", "第一条消息").await;
    learner.update("g1", "第二条消息").await;
    learner.update("g1", "第三条消息").await;

    // the spawned task runs off the caller's await points
    let mut learned = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !learner.profile("g1").await.style_expressions.is_empty() {
            learned = true;
            break;
        }
    }
    assert!(learned, "background learning never landed");
    assert_eq!(port.calls.lock().await.len(), 1);
}

// =============================================================
// Prompt rendering
// =============================================================

#[tokio::test]
async fn prompt_prefers_scenarios_over_word_tables() {
    let port = ScriptedPort::new(r#"[{"situation":"表示赞叹","expressions":["绝绝子"]}]"#);
    let learner = learner_with(ExpressionConfig::default(), Some(port));
    learner
        .learn_style("g1", vec!["样本消息".into()])
        .await
        .unwrap();

    let prompt = learner.prompt_for_group("g1").await;
    assert!(prompt.contains("【群聊表达风格】"));
    assert!(prompt.contains("表示赞叹时，群友常说\"绝绝子\""));
    assert!(prompt.contains("适当使用这些表达方式"));
    assert!(!prompt.contains("【群里常用词】"));
}

#[tokio::test]
async fn prompt_falls_back_to_frequency_tables() {
    let learner = learner();
    // "滑雪" needs to clear the default min frequency of 3
    for _ in 0..15 {
        learner.update("g1", "滑雪 好玩吗😂 笑死").await;
    }

    let prompt = learner.prompt_for_group("g1").await;
    assert!(prompt.contains("【群里常用词】"));
    assert!(prompt.contains("滑雪"));
    assert!(prompt.contains("【常见句式】"));
    assert!(prompt.contains("笑死"));
    assert!(prompt.contains("【常用表情】😂"));
}

#[tokio::test]
async fn prompt_empty_for_unknown_group() {
    let learner = learner();
    assert_eq!(learner.prompt_for_group("nobody").await, "");
}

// =============================================================
// Serialization
// =============================================================

#[tokio::test]
async fn profile_round_trips_with_wire_field_names() {
    let learner = learner();
    for _ in 0..5 {
        learner.update("g1", "滑雪 好玩吗😂").await;
    }

    let profile = learner.profile("g1").await;
    let raw = serde_json::to_string(&profile).unwrap();
    let back: ExpressionProfile = serde_json::from_str(&raw).unwrap();
    assert_eq!(back.message_count, profile.message_count);
    assert_eq!(back.words, profile.words);
    assert_eq!(back.emojis, profile.emojis);
    assert_eq!(
        back.last_update.timestamp_millis(),
        profile.last_update.timestamp_millis()
    );

    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(value.get("messageCount").is_some());
    assert!(value.get("styleExpressions").is_some());
    assert!(value.get("lastAiLearnTime").is_some());
}
