//! 测试辅助：静态事实表
//!
//! 实现 [`FactResolver`]，记录每一次事实查询，便于断言短路行为。

use crate::almanac::{FactResolver, JsonPathResolver, PathResolver};
use crate::error::{Result, RuleError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct StaticFacts {
    values: HashMap<String, Value>,
    priorities: HashMap<String, i64>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl StaticFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, fact_id: &str, value: Value) -> Self {
        self.values.insert(fact_id.to_string(), value);
        self
    }

    /// 查询该事实时返回错误
    pub fn failing(mut self, fact_id: &str) -> Self {
        self.failing.insert(fact_id.to_string());
        self
    }

    pub fn with_priority(mut self, fact_id: &str, priority: i64) -> Self {
        self.priorities.insert(fact_id.to_string(), priority);
        self
    }

    /// 按查询顺序返回被查询过的事实 ID
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn was_called(&self, fact_id: &str) -> bool {
        self.calls.lock().iter().any(|c| c == fact_id)
    }
}

#[async_trait]
impl FactResolver for StaticFacts {
    async fn fact_value(
        &self,
        fact_id: &str,
        _params: Option<&Value>,
        path: Option<&str>,
    ) -> Result<Value> {
        self.calls.lock().push(fact_id.to_string());

        if self.failing.contains(fact_id) {
            return Err(RuleError::fact(fact_id, "fact source unavailable"));
        }

        let value = self
            .values
            .get(fact_id)
            .cloned()
            .ok_or_else(|| RuleError::UndefinedFact(fact_id.to_string()))?;

        Ok(match path {
            Some(path) => JsonPathResolver.resolve(&value, path),
            None => value,
        })
    }

    fn fact_priority(&self, fact_id: &str) -> Option<i64> {
        self.priorities.get(fact_id).copied()
    }
}
