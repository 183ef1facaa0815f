use std::sync::Arc;

use crate::affect::{AffectState, AffectTracker};
use crate::config::RapportConfig;
use crate::expression::ExpressionLearner;
use crate::memory::group::GroupMemoryStore;
use crate::memory::user::UserMemoryStore;
use crate::store::{Keyspace, KvStore};

/// Coordinates the three subsystems behind a single observe/render API.
///
/// Fragment assembly order: affect, style, user memory, group memory.
/// Every fragment tolerates being empty, so the assembled context only
/// contains what the engine actually knows.
pub struct SocialEngine {
    pub affect: AffectTracker,
    pub expression: Arc<ExpressionLearner>,
    pub user_memory: Arc<UserMemoryStore>,
    pub group_memory: Arc<GroupMemoryStore>,
}

impl SocialEngine {
    pub fn new(store: Arc<dyn KvStore>, config: &RapportConfig) -> Self {
        let keys = Keyspace::new(config.store.namespace.clone());
        let extractor = config.extraction.port();

        Self {
            affect: AffectTracker::new(
                Arc::clone(&store),
                keys.clone(),
                config.affect.clone(),
            ),
            expression: Arc::new(ExpressionLearner::new(
                Arc::clone(&store),
                keys.clone(),
                extractor.clone(),
                config.expression.clone(),
            )),
            user_memory: Arc::new(UserMemoryStore::new(
                Arc::clone(&store),
                keys.clone(),
                extractor.clone(),
                config.memory.clone(),
            )),
            group_memory: Arc::new(GroupMemoryStore::new(
                store,
                keys,
                extractor,
                config.memory.clone(),
            )),
        }
    }

    /// Fold one inbound group message into affect and style state and
    /// return the updated affect.
    pub async fn observe_message(
        &self,
        group_id: &str,
        text: &str,
        was_mentioned: bool,
    ) -> AffectState {
        let state = self.affect.observe(group_id, text, was_mentioned).await;
        self.expression.update(group_id, text).await;
        state
    }

    /// Spawn memory extraction for a completed exchange. The caller is
    /// never blocked on the extraction port; failures are logged inside
    /// the spawned tasks.
    pub fn learn_from_exchange(
        &self,
        group_id: &str,
        user_id: &str,
        display_name: &str,
        user_message: &str,
        bot_reply: &str,
    ) {
        let user_store = Arc::clone(&self.user_memory);
        let group = group_id.to_string();
        let user = user_id.to_string();
        let message = user_message.to_string();
        let reply = bot_reply.to_string();
        tokio::spawn(async move {
            user_store
                .extract_and_save(&group, &user, &message, &reply)
                .await;
        });

        let group_store = Arc::clone(&self.group_memory);
        let group = group_id.to_string();
        let name = display_name.to_string();
        let message = user_message.to_string();
        tokio::spawn(async move {
            group_store.extract_and_save(&group, &name, &message).await;
        });
    }

    /// Assemble the full social context for one generation turn.
    pub async fn prompt_for(&self, group_id: &str, user_id: &str) -> String {
        let fragments = [
            self.affect.prompt_for_group(group_id).await,
            self.expression.prompt_for_group(group_id).await,
            self.user_memory.prompt_for(group_id, user_id).await,
            self.group_memory.prompt_for(group_id).await,
        ];
        fragments
            .iter()
            .filter(|fragment| !fragment.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
