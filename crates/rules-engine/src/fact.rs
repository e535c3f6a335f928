//! 事实定义
//!
//! 事实是条件左值（以及 `{fact: ...}` 右值）的数据来源：
//! - 常量事实：固定值，不参与缓存
//! - 动态事实：异步计算函数 `(params, almanac) -> value`，默认按参数缓存

use crate::almanac::Almanac;
use crate::condition::DEFAULT_PRIORITY;
use crate::error::Result;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 事实计算结果
pub type FactFuture = BoxFuture<'static, Result<Value>>;

/// 动态事实计算函数
pub type FactCallback = dyn Fn(Value, Almanac) -> FactFuture + Send + Sync;

/// 事实选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactOptions {
    /// 相同参数的计算结果在单次运行内复用
    pub cache: bool,
    /// 未显式设置优先级的条件使用该优先级调度
    pub priority: i64,
}

impl Default for FactOptions {
    fn default() -> Self {
        Self {
            cache: true,
            priority: DEFAULT_PRIORITY,
        }
    }
}

#[derive(Clone)]
pub enum FactValue {
    Constant(Value),
    Dynamic(Arc<FactCallback>),
}

/// 事实
#[derive(Clone)]
pub struct Fact {
    id: String,
    value: FactValue,
    options: FactOptions,
}

impl Fact {
    /// 常量事实
    pub fn constant(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: FactValue::Constant(value),
            options: FactOptions::default(),
        }
    }

    /// 异步计算的动态事实
    pub fn dynamic<F, Fut>(id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Value, Almanac) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let callback: Arc<FactCallback> =
            Arc::new(move |params, almanac| callback(params, almanac).boxed());
        Self {
            id: id.into(),
            value: FactValue::Dynamic(callback),
            options: FactOptions::default(),
        }
    }

    /// 同步计算的动态事实，计算在求值时才执行
    pub fn from_fn<F>(id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Value, &Almanac) -> Result<Value> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Self::dynamic(id, move |params, almanac| {
            let callback = Arc::clone(&callback);
            async move { callback(&params, &almanac) }
        })
    }

    pub fn with_options(mut self, options: FactOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.options.cache = cache;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> FactOptions {
        self.options
    }

    pub fn priority(&self) -> i64 {
        self.options.priority
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.value, FactValue::Constant(_))
    }

    pub fn constant_value(&self) -> Option<&Value> {
        match &self.value {
            FactValue::Constant(value) => Some(value),
            FactValue::Dynamic(_) => None,
        }
    }

    /// 缓存键 `{id}:{params}`；常量事实与关闭缓存的事实返回 None
    pub fn cache_key(&self, params: Option<&Value>) -> Option<String> {
        if self.is_constant() || !self.options.cache {
            return None;
        }
        let params = params.map(Value::to_string).unwrap_or_else(|| "{}".to_string());
        Some(format!("{}:{}", self.id, params))
    }

    /// 计算事实值
    pub(crate) fn calculate(&self, params: Value, almanac: Almanac) -> FactFuture {
        match &self.value {
            FactValue::Constant(value) => futures::future::ready(Ok(value.clone())).boxed(),
            FactValue::Dynamic(callback) => callback(params, almanac),
        }
    }
}

impl fmt::Debug for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.value {
            FactValue::Constant(_) => "constant",
            FactValue::Dynamic(_) => "dynamic",
        };
        f.debug_struct("Fact")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("options", &self.options)
            .finish()
    }
}
