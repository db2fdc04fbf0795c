//! Context Store
//!
//! Conversation memory and metadata keyed by client identity. The store owns
//! every [`Context`]; callers receive snapshots and mutate through the store,
//! which applies each mutation atomically under the entry's shard lock.
//!
//! Mutations on an unknown identity create the context first.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use super::{errors::MCPResult, tools::ExecutionStatus};

/// Role assigned to responses produced by the local application
pub const ROLE_ASSISTANT: &str = "assistant";
/// Role of tool-result messages
pub const ROLE_TOOL: &str = "tool";

/// One role-tagged unit of conversation memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Stable identifier, assigned on first append when empty
    #[serde(default)]
    pub id: String,
    /// Speaker role, e.g. "user" or "assistant"
    #[serde(default)]
    pub role: String,
    /// Block content
    #[serde(default)]
    pub content: String,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

impl MemoryBlock {
    /// Create a block with a fresh id and the current time
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            content: content.into(),
            time: Utc::now(),
        }
    }

    /// Override the block id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn ensure_id(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self
    }
}

/// Execution record attached to a tool-result message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultMetadata {
    pub execution_status: ExecutionStatus,
    pub executed_at: DateTime<Utc>,
    /// Hex MD5 digest of the recorded content
    #[serde(default)]
    pub output_hash: String,
    /// Where the tool ran, e.g. the transport binding
    #[serde(default)]
    pub execution_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Entry of the conversation message history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultMetadata>,
}

/// Accumulated memory and metadata of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub memory: Vec<MemoryBlock>,
    /// Tool-result history
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub is_archived: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl Context {
    /// Create an empty context carrying `metadata`
    pub fn new(metadata: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            memory: Vec::new(),
            messages: Vec::new(),
            metadata,
            is_archived: false,
        }
    }

    /// Refresh `updated_at`, keeping it strictly increasing even when the
    /// clock has not advanced
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + ChronoDuration::nanoseconds(1)
        };
    }

    /// Apply a context update. Each effect is applied only when its field
    /// is present: metadata merged key-wise, memory replaced wholesale, then
    /// blocks appended in order, archive flag set.
    pub fn apply_update(&mut self, update: &ContextUpdate) {
        if let Some(metadata) = &update.metadata {
            self.metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(blocks) = &update.replace {
            self.memory = blocks.iter().cloned().map(MemoryBlock::ensure_id).collect();
        }
        if let Some(blocks) = &update.append {
            self.memory
                .extend(blocks.iter().cloned().map(MemoryBlock::ensure_id));
        }
        if let Some(archive) = update.archive {
            self.is_archived = archive;
        }
        self.touch();
    }

    /// Append blocks to memory
    pub fn append_memory(&mut self, blocks: impl IntoIterator<Item = MemoryBlock>) {
        self.memory
            .extend(blocks.into_iter().map(MemoryBlock::ensure_id));
        self.touch();
    }

    /// Replace the whole memory list
    pub fn replace_memory(&mut self, blocks: Vec<MemoryBlock>) {
        self.memory = blocks.into_iter().map(MemoryBlock::ensure_id).collect();
        self.touch();
    }

    /// Replace the content of the block with `block_id`. Returns `false`
    /// when no block matches; that is not an error.
    pub fn update_block_content(&mut self, block_id: &str, content: &str) -> bool {
        match self.memory.iter_mut().find(|b| b.id == block_id) {
            Some(block) => {
                block.content = content.to_string();
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Record the result of an executed tool call in the message history
    pub fn add_tool_result_message(
        &mut self,
        tool_call_id: &str,
        content: &str,
        status: ExecutionStatus,
        error_message: Option<String>,
        execution_env: &str,
    ) -> Message {
        let now = Utc::now();
        let message = Message {
            id: format!("msg_{}", Uuid::new_v4()),
            role: ROLE_TOOL.to_string(),
            content: content.to_string(),
            timestamp: now,
            tool_call_id: Some(tool_call_id.to_string()),
            tool_result: Some(ToolResultMetadata {
                execution_status: status,
                executed_at: now,
                output_hash: format!("{:x}", md5::compute(content.as_bytes())),
                execution_env: execution_env.to_string(),
                error_message,
            }),
        };
        self.messages.push(message.clone());
        self.touch();
        message
    }

    /// Blocks spoken by `role`, in memory order
    pub fn memory_by_role(&self, role: &str) -> Vec<&MemoryBlock> {
        self.memory.iter().filter(|b| b.role == role).collect()
    }

    /// Drop all memory blocks, keeping id and metadata
    pub fn clear_memory(&mut self) {
        self.memory.clear();
        self.touch();
    }

    /// Encode to wire form
    pub fn to_json(&self) -> MCPResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from wire form
    pub fn from_json(json: &str) -> MCPResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Update carried by `context/*` and `memory/*` notifications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdate {
    /// Target context id, informational
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<Vec<MemoryBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<Vec<MemoryBlock>>,
}

impl ContextUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_append(mut self, block: MemoryBlock) -> Self {
        self.append.get_or_insert_with(Vec::new).push(block);
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_replace(mut self, blocks: Vec<MemoryBlock>) -> Self {
        self.replace = Some(blocks);
        self
    }
}

/// Identity -> Context map
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: DashMap<String, Context>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_context<R>(&self, identity: &str, f: impl FnOnce(&mut Context) -> R) -> R {
        let mut entry = self
            .contexts
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!("Creating context for {}", identity);
                Context::default()
            });
        f(entry.value_mut())
    }

    /// Return the context for `identity`, creating it when absent
    pub fn get_or_create(&self, identity: &str) -> Context {
        self.with_context(identity, |ctx| ctx.clone())
    }

    /// Snapshot of the context for `identity`, if any
    pub fn get(&self, identity: &str) -> Option<Context> {
        self.contexts.get(identity).map(|ctx| ctx.value().clone())
    }

    pub fn apply_update(&self, identity: &str, update: &ContextUpdate) -> Context {
        self.with_context(identity, |ctx| {
            ctx.apply_update(update);
            ctx.clone()
        })
    }

    /// Replace the context with a fresh one, preserving only its metadata
    pub fn clear(&self, identity: &str) -> Context {
        self.with_context(identity, |ctx| {
            let metadata = std::mem::take(&mut ctx.metadata);
            let mut fresh = Context::new(metadata);
            // Keep updated_at monotonic across the replacement
            if fresh.updated_at <= ctx.updated_at {
                fresh.updated_at = ctx.updated_at + ChronoDuration::nanoseconds(1);
            }
            *ctx = fresh;
            ctx.clone()
        })
    }

    pub fn append_memory(&self, identity: &str, blocks: Vec<MemoryBlock>) -> Context {
        self.with_context(identity, |ctx| {
            ctx.append_memory(blocks);
            ctx.clone()
        })
    }

    pub fn replace_memory(&self, identity: &str, blocks: Vec<MemoryBlock>) -> Context {
        self.with_context(identity, |ctx| {
            ctx.replace_memory(blocks);
            ctx.clone()
        })
    }

    /// Id-targeted content replacement; unmatched ids are ignored
    pub fn update_block_content(&self, identity: &str, block_id: &str, content: &str) -> bool {
        self.with_context(identity, |ctx| ctx.update_block_content(block_id, content))
    }

    pub fn add_tool_result_message(
        &self,
        identity: &str,
        tool_call_id: &str,
        content: &str,
        status: ExecutionStatus,
        error_message: Option<String>,
        execution_env: &str,
    ) -> Message {
        self.with_context(identity, |ctx| {
            ctx.add_tool_result_message(tool_call_id, content, status, error_message, execution_env)
        })
    }

    /// Append an assistant block to `identity`'s memory
    pub fn append_assistant_response(&self, identity: &str, content: &str) -> MemoryBlock {
        let block = MemoryBlock::new(ROLE_ASSISTANT, content);
        self.with_context(identity, |ctx| ctx.append_memory([block.clone()]));
        block
    }

    pub fn remove(&self, identity: &str) -> Option<Context> {
        self.contexts.remove(identity).map(|(_, ctx)| ctx)
    }

    pub fn identities(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
