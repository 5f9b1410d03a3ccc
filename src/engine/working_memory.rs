// ── Kioku Engine: Working Memory ───────────────────────────────────────────
// Bounded ring buffer of conversation turns plus a small context
// scratchpad. Purely in-memory; persistence goes through the serde
// snapshot. Not internally synchronized: callers own the locking.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::atoms::types::{now_ts, JsonMap};

pub const DEFAULT_MAX_TURNS: usize = 20;

// ── Turns ──────────────────────────────────────────────────────────────────

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// RFC 3339, set when the turn is added.
    pub timestamp: String,
    #[serde(default)]
    pub metadata: JsonMap,
}

// ── Snapshot ───────────────────────────────────────────────────────────────

/// Serializable projection of the full working-memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemorySnapshot {
    pub max_turns: usize,
    pub history: Vec<ConversationTurn>,
    pub context: JsonMap,
}

// ── Buffer ─────────────────────────────────────────────────────────────────

/// Short-term conversational state. Oldest turns are evicted silently once
/// `max_turns` is exceeded.
pub struct WorkingMemory {
    max_turns: usize,
    history: VecDeque<ConversationTurn>,
    context: JsonMap,
}

impl WorkingMemory {
    /// `max_turns` of 0 is coerced to 1 so the buffer always holds the
    /// latest turn.
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            history: VecDeque::new(),
            context: JsonMap::new(),
        }
    }

    pub fn add_turn(&mut self, role: Role, content: impl Into<String>, metadata: JsonMap) {
        self.history.push_back(ConversationTurn {
            role,
            content: content.into(),
            timestamp: now_ts(),
            metadata,
        });
        while self.history.len() > self.max_turns {
            self.history.pop_front();
        }
    }

    /// Turns in chronological order, optionally only the most recent
    /// `limit`.
    pub fn history(&self, limit: Option<usize>) -> Vec<&ConversationTurn> {
        let turns: Vec<&ConversationTurn> = self.history.iter().collect();
        match limit {
            Some(n) if n < turns.len() => turns[turns.len() - n..].to_vec(),
            _ => turns,
        }
    }

    /// `role: content` lines, one per turn, for prompt assembly.
    pub fn history_for_prompt(&self, limit: Option<usize>) -> String {
        self.history(limit)
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn last_user_message(&self) -> Option<&ConversationTurn> {
        self.history.iter().rev().find(|t| t.role == Role::User)
    }

    pub fn last_assistant_message(&self) -> Option<&ConversationTurn> {
        self.history.iter().rev().find(|t| t.role == Role::Assistant)
    }

    /// Rough token estimate for the whole buffer: total characters divided
    /// by `chars_per_token` (use ~2 for CJK-heavy text, ~4 for English).
    pub fn estimate_token_count(&self, chars_per_token: usize) -> usize {
        let chars: usize = self
            .history
            .iter()
            .map(|t| t.content.chars().count())
            .sum();
        chars / chars_per_token.max(1)
    }

    pub fn turn_count(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Drop all turns and the context scratchpad.
    pub fn clear(&mut self) {
        self.history.clear();
        self.context.clear();
    }

    // ── Context scratchpad ─────────────────────────────────────────────────

    pub fn set_context(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), value);
    }

    pub fn get_context(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    pub fn remove_context(&mut self, key: &str) -> Option<serde_json::Value> {
        self.context.remove(key)
    }

    // ── Snapshots ──────────────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> WorkingMemorySnapshot {
        WorkingMemorySnapshot {
            max_turns: self.max_turns,
            history: self.history.iter().cloned().collect(),
            context: self.context.clone(),
        }
    }

    /// Restore from a snapshot. History beyond the snapshot's own
    /// `max_turns` is trimmed from the front.
    pub fn from_snapshot(snapshot: WorkingMemorySnapshot) -> Self {
        let mut wm = Self::new(snapshot.max_turns);
        wm.history = snapshot.history.into_iter().collect();
        while wm.history.len() > wm.max_turns {
            wm.history.pop_front();
        }
        wm.context = snapshot.context;
        wm
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(wm: &mut WorkingMemory, role: Role, content: &str) {
        wm.add_turn(role, content, JsonMap::new());
    }

    #[test]
    fn oldest_turns_are_evicted() {
        let mut wm = WorkingMemory::new(3);
        for i in 0..5 {
            turn(&mut wm, Role::User, &format!("msg{i}"));
        }
        assert_eq!(wm.turn_count(), 3);
        let history = wm.history(None);
        assert_eq!(history[0].content, "msg2");
        assert_eq!(history[2].content, "msg4");
    }

    #[test]
    fn zero_capacity_is_coerced_to_one() {
        let mut wm = WorkingMemory::new(0);
        turn(&mut wm, Role::User, "a");
        turn(&mut wm, Role::User, "b");
        assert_eq!(wm.turn_count(), 1);
        assert_eq!(wm.history(None)[0].content, "b");
    }

    #[test]
    fn history_limit_returns_most_recent() {
        let mut wm = WorkingMemory::new(10);
        for i in 0..4 {
            turn(&mut wm, Role::User, &format!("msg{i}"));
        }
        let last_two = wm.history(Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "msg2");
        assert_eq!(last_two[1].content, "msg3");
        assert_eq!(wm.history(Some(100)).len(), 4);
    }

    #[test]
    fn role_lookups_scan_backwards() {
        let mut wm = WorkingMemory::default();
        turn(&mut wm, Role::User, "first question");
        turn(&mut wm, Role::Assistant, "first answer");
        turn(&mut wm, Role::User, "second question");
        assert_eq!(wm.last_user_message().unwrap().content, "second question");
        assert_eq!(wm.last_assistant_message().unwrap().content, "first answer");
        wm.clear();
        assert!(wm.last_user_message().is_none());
    }

    #[test]
    fn prompt_projection_uses_role_prefixes() {
        let mut wm = WorkingMemory::default();
        turn(&mut wm, Role::User, "你好");
        turn(&mut wm, Role::Assistant, "你好呀");
        assert_eq!(wm.history_for_prompt(None), "user: 你好\nassistant: 你好呀");
    }

    #[test]
    fn token_estimate_counts_chars_not_bytes() {
        let mut wm = WorkingMemory::default();
        turn(&mut wm, Role::User, "四个汉字");
        assert_eq!(wm.estimate_token_count(2), 2);
        assert_eq!(wm.estimate_token_count(0), 4);
    }

    #[test]
    fn clear_wipes_history_and_context() {
        let mut wm = WorkingMemory::default();
        turn(&mut wm, Role::User, "hi");
        wm.set_context("mood", serde_json::json!("happy"));
        wm.clear();
        assert!(wm.is_empty());
        assert!(wm.get_context("mood").is_none());
    }

    #[test]
    fn context_scratchpad_round_trip() {
        let mut wm = WorkingMemory::default();
        wm.set_context("affinity", serde_json::json!(42));
        assert_eq!(wm.get_context("affinity"), Some(&serde_json::json!(42)));
        assert_eq!(wm.remove_context("affinity"), Some(serde_json::json!(42)));
        assert!(wm.remove_context("affinity").is_none());
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let mut wm = WorkingMemory::new(5);
        turn(&mut wm, Role::User, "remember this");
        wm.set_context("k", serde_json::json!("v"));
        let snapshot = wm.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: WorkingMemorySnapshot = serde_json::from_str(&json).unwrap();
        let restored = WorkingMemory::from_snapshot(back);
        assert_eq!(restored.turn_count(), 1);
        assert_eq!(restored.history(None)[0].content, "remember this");
        assert_eq!(restored.get_context("k"), Some(&serde_json::json!("v")));
    }

    #[test]
    fn role_parsing_is_strict_lowercase() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!("system".parse::<Role>().unwrap(), Role::System);
        assert!("User".parse::<Role>().is_err());
        assert!("bot".parse::<Role>().is_err());
    }
}
