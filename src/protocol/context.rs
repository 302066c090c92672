//! 编辑器上下文快照
//!
//! 由编辑器集成方生成，核心层只负责大小约束：超过上限时按「保留头部」策略确定性截断。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub path: String,
    pub content: String,
    pub filetype: String,
    pub modified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFile {
    pub path: String,
    pub filetype: String,
    pub modified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub severity: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEdit {
    pub file_path: String,
    pub change_type: String,
    pub timestamp: i64,
}

/// 不可变的编辑器状态快照，创建请求时附带
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_buffer: Option<BufferSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub open_files: Vec<OpenFile>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub recent_edits: Vec<RecentEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    /// 是否经过截断
    #[serde(default)]
    pub truncated: bool,
}

impl ContextBundle {
    /// 所有内容都被丢弃后剩下的快照
    pub fn minimal() -> Self {
        Self {
            truncated: true,
            ..Self::default()
        }
    }

    /// 序列化后的字节数
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// 约束到 `max_bytes` 以内。
    ///
    /// 顺序固定：先截断缓冲区内容（保留开头），再依次丢弃 recent_edits、diagnostics、open_files 的尾部元素，
    /// 仍超限则丢弃整个缓冲区与工程根目录，最后丢弃光标，只剩 [`ContextBundle::minimal`]。
    /// 同样的输入总得到同样的输出；结果不超过 `max(max_bytes, minimal().encoded_len())`。
    ///
    /// 每个被丢弃的元素只单独序列化一次，耗时与快照大小成线性关系。
    pub fn bounded(mut self, max_bytes: usize) -> Self {
        if self.encoded_len() <= max_bytes {
            return self;
        }
        self.truncated = true;

        let mut size = self.encoded_len();
        if let Some(buffer) = self.current_buffer.as_mut() {
            let excess = size.saturating_sub(max_bytes);
            // 每个原始字节编码后至少占一个字节，按原始长度裁掉 excess 后通常已经达标，转义字符导致的误差再循环校正
            let keep = buffer.content.len().saturating_sub(excess);
            truncate_at_char_boundary(&mut buffer.content, keep);
            size = self.encoded_len();
            while size > max_bytes {
                let Some(buffer) = self.current_buffer.as_mut() else {
                    break;
                };
                if buffer.content.is_empty() {
                    break;
                }
                let keep = buffer.content.len().saturating_sub((size - max_bytes).max(1));
                truncate_at_char_boundary(&mut buffer.content, keep);
                size = self.encoded_len();
            }
        }

        if size > max_bytes {
            drop_tail(&mut self.recent_edits, size, max_bytes);
            size = self.encoded_len();
        }
        if size > max_bytes {
            drop_tail(&mut self.diagnostics, size, max_bytes);
            size = self.encoded_len();
        }
        if size > max_bytes {
            drop_tail(&mut self.open_files, size, max_bytes);
            size = self.encoded_len();
        }
        if size > max_bytes {
            self.current_buffer = None;
            self.project_root = None;
            size = self.encoded_len();
        }
        if size > max_bytes {
            self.cursor = None;
        }
        self
    }
}

/// 从尾部弹出元素直到估算大小不超过上限
///
/// 紧凑 JSON 数组里除最后一个元素外，每个元素还带一个逗号。
fn drop_tail<T: Serialize>(items: &mut Vec<T>, mut size: usize, max_bytes: usize) {
    while size > max_bytes {
        let Some(last) = items.pop() else {
            break;
        };
        let len = serde_json::to_vec(&last).map(|v| v.len()).unwrap_or(0);
        let separator = usize::from(!items.is_empty());
        size = size.saturating_sub(len + separator);
    }
}

fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
