//! 会话标签切换
//!
//! 切换是“先查再改”：已有则删除，没有则插入。这一步对其他客户端的并发切换不是原子的，
//! 结果以最后一次写入为准。
//!
//! 绑定了会话列表时，本地标签集合会先按预期结果乐观修改；远程失败时回滚，远程结果与预期
//! 不一致时（其他客户端刚刚改过）以远程结果为准修正本地。

use crate::im::conversation::service::{RosterHandle, RosterState};
use crate::im::error::ChatResult;
use crate::im::gateway::Gateway;
use crate::im::label::api::LabelApi;
use crate::im::optimistic::Optimistic;
use crate::im::types::Label;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 会话列表上的一次标签乐观修改
struct LabelToggle {
    conversation_id: String,
    label: Label,
    assigned: bool,
    changed: bool,
}

impl Optimistic<RosterState> for LabelToggle {
    fn apply(&mut self, state: &mut RosterState) {
        self.changed = state.set_label(&self.conversation_id, &self.label, self.assigned);
    }

    fn revert(&mut self, state: &mut RosterState) {
        if self.changed {
            state.set_label(&self.conversation_id, &self.label, !self.assigned);
            self.changed = false;
        }
    }
}

/// 标签管理
pub struct LabelManager {
    api: LabelApi,
    roster: Option<RosterHandle>,
}

impl LabelManager {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            api: LabelApi::new(gateway),
            roster: None,
        }
    }

    /// 绑定会话列表，切换时同步修改列表中的标签
    pub fn with_roster(mut self, roster: RosterHandle) -> Self {
        self.roster = Some(roster);
        self
    }

    pub async fn list_labels(&self) -> ChatResult<Vec<Label>> {
        Ok(self.api.list_labels().await?)
    }

    /// 切换会话上的标签，返回切换后该标签是否在会话上
    pub async fn toggle(
        &self,
        conversation_id: &str,
        label: &Label,
        assigned_by: &str,
    ) -> ChatResult<bool> {
        let mut pending = match &self.roster {
            Some(roster) => {
                let local = roster.with_state(|s| s.has_label(conversation_id, &label.id));
                match local {
                    Some(present) => {
                        let mut cmd = LabelToggle {
                            conversation_id: conversation_id.to_string(),
                            label: label.clone(),
                            assigned: !present,
                            changed: false,
                        };
                        roster.with_state(|s| cmd.apply(s));
                        roster.publish().await;
                        Some((roster, cmd))
                    }
                    None => None,
                }
            }
            None => None,
        };

        match self.toggle_remote(conversation_id, &label.id, assigned_by).await {
            Ok(assigned) => {
                info!(
                    "[Label] 🏷️ 会话 {} 的标签 {} 已{}",
                    conversation_id,
                    label.name,
                    if assigned { "添加" } else { "移除" }
                );
                if let Some((roster, cmd)) = pending.as_ref() {
                    if cmd.assigned != assigned {
                        warn!(
                            "[Label] 会话 {} 的标签 {} 已被其他客户端修改，以远程结果为准",
                            conversation_id, label.id
                        );
                        roster.with_state(|s| s.set_label(conversation_id, label, assigned));
                        roster.publish().await;
                    }
                }
                Ok(assigned)
            }
            Err(e) => {
                error!("[Label] ❌ 切换会话 {} 的标签 {} 失败: {}", conversation_id, label.id, e);
                if let Some((roster, cmd)) = pending.as_mut() {
                    roster.with_state(|s| cmd.revert(s));
                    roster.publish().await;
                }
                Err(e)
            }
        }
    }

    async fn toggle_remote(
        &self,
        conversation_id: &str,
        label_id: &str,
        assigned_by: &str,
    ) -> ChatResult<bool> {
        if self.api.is_assigned(conversation_id, label_id).await? {
            self.api.unassign(conversation_id, label_id).await?;
            Ok(false)
        } else {
            self.api.assign(conversation_id, label_id, assigned_by).await?;
            Ok(true)
        }
    }
}
