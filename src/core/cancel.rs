//! 任务级取消注册表
//!
//! 每个运行中的任务持有一个从根 token 派生的子 token；取消请求只设置标志，
//! 执行器在步骤边界检查，不会中断正在进行的工具调用。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct CancelRegistry {
    root: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// 为任务登记取消 token；重复登记返回同一个 token
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(task_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 请求取消；任务未登记（未在运行）时返回 false
    pub fn cancel(&self, task_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, task_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
