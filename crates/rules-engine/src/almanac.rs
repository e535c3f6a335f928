//! 事实簿（Almanac）
//!
//! 单次引擎运行的事实解析上下文：
//! - 按 ID 查找事实定义（运行时事实覆盖引擎注册的同名事实）
//! - 动态事实按 `{id}:{params}` 缓存，同一键的并发请求共享同一次计算
//! - 对解析结果按路径取值
//! - 收集本次运行触发的事件与规则结果

use crate::error::{Result, RuleError};
use crate::fact::{Fact, FactFuture};
use crate::rule::{Event, RuleResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use rules_shared::observability::metrics::record_fact_resolution;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

// ==================== 事实解析接口 ====================

/// 条件评估所需的事实解析能力
#[async_trait]
pub trait FactResolver: Send + Sync {
    /// 解析事实值，`path` 存在时返回路径指向的子值
    async fn fact_value(
        &self,
        fact_id: &str,
        params: Option<&Value>,
        path: Option<&str>,
    ) -> Result<Value>;

    /// 事实定义的优先级，未知事实返回 None
    fn fact_priority(&self, _fact_id: &str) -> Option<i64> {
        None
    }
}

/// 路径取值
pub trait PathResolver: Send + Sync {
    fn resolve(&self, value: &Value, path: &str) -> Value;
}

impl<F> PathResolver for F
where
    F: Fn(&Value, &str) -> Value + Send + Sync,
{
    fn resolve(&self, value: &Value, path: &str) -> Value {
        self(value, path)
    }
}

/// 默认路径解析器
///
/// 支持 `$.a.b[0]`、`$['a']['b']`、`a.b.0` 以及 JSON Pointer `/a/b/0`，
/// 路径不存在时返回 null。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathResolver;

impl PathResolver for JsonPathResolver {
    fn resolve(&self, value: &Value, path: &str) -> Value {
        if path.starts_with('/') {
            return value.pointer(path).cloned().unwrap_or(Value::Null);
        }

        let mut current = value;
        for segment in path_segments(path) {
            let next = match current {
                Value::Object(map) => map.get(&segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

fn path_segments(path: &str) -> Vec<String> {
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let quote = chars.next_if(|c| *c == '\'' || *c == '"');
                let mut key = String::new();
                for c in chars.by_ref() {
                    if Some(c) == quote {
                        continue;
                    }
                    if c == ']' {
                        break;
                    }
                    key.push(c);
                }
                segments.push(key);
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

// ==================== Almanac ====================

/// 规则结果对应的事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlmanacOptions {
    /// 未定义的事实解析为 null 而不是报错
    pub allow_undefined_facts: bool,
}

type FactCache = DashMap<String, Shared<FactFuture>>;

struct AlmanacInner {
    options: AlmanacOptions,
    facts: DashMap<String, Arc<Fact>>,
    path_resolver: Arc<dyn PathResolver>,
    events: Mutex<Vec<(EventOutcome, Event)>>,
    results: Mutex<Vec<RuleResult>>,
}

/// 事实簿，克隆后共享同一份状态
///
/// 缓存中的 future 会持有传给事实回调的事实簿，回调拿到的是只弱引用缓存的视图，
/// 所有持有者释放后缓存随之释放。
#[derive(Clone)]
pub struct Almanac {
    inner: Arc<AlmanacInner>,
    _cache_owner: Option<Arc<FactCache>>,
    cache: Weak<FactCache>,
}

impl Almanac {
    pub fn new(options: AlmanacOptions) -> Self {
        Self::with_path_resolver(options, Arc::new(JsonPathResolver))
    }

    /// 使用自定义路径解析器
    pub fn with_path_resolver(options: AlmanacOptions, path_resolver: Arc<dyn PathResolver>) -> Self {
        let cache = Arc::new(FactCache::new());
        Self {
            inner: Arc::new(AlmanacInner {
                options,
                facts: DashMap::new(),
                path_resolver,
                events: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
            }),
            cache: Arc::downgrade(&cache),
            _cache_owner: Some(cache),
        }
    }

    /// 传给事实回调的视图，不延长缓存的生命周期
    fn view(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _cache_owner: None,
            cache: Weak::clone(&self.cache),
        }
    }

    pub fn options(&self) -> AlmanacOptions {
        self.inner.options
    }

    /// 添加或替换事实定义，同时清除该事实的缓存结果
    pub fn add_fact(&self, fact: impl Into<Arc<Fact>>) {
        let fact = fact.into();
        if let Some(cache) = self.cache.upgrade() {
            let prefix = format!("{}:", fact.id());
            cache.retain(|key, _| !key.starts_with(&prefix));
        }
        debug!(fact = fact.id(), "almanac::add_fact");
        self.inner.facts.insert(fact.id().to_string(), fact);
    }

    /// 添加运行时常量事实
    pub fn add_runtime_fact(&self, fact_id: impl Into<String>, value: Value) {
        self.add_fact(Fact::constant(fact_id, value));
    }

    pub fn get_fact(&self, fact_id: &str) -> Option<Arc<Fact>> {
        self.inner.facts.get(fact_id).map(|entry| Arc::clone(entry.value()))
    }

    /// 解析事实值
    pub async fn fact_value(
        &self,
        fact_id: &str,
        params: Option<&Value>,
        path: Option<&str>,
    ) -> Result<Value> {
        let Some(fact) = self.get_fact(fact_id) else {
            if self.inner.options.allow_undefined_facts {
                debug!(fact = fact_id, "almanac::fact_value 未定义的事实，返回 null");
                return Ok(Value::Null);
            }
            return Err(RuleError::UndefinedFact(fact_id.to_string()));
        };

        let value = match fact.cache_key(params) {
            Some(key) => self.cached_value(&fact, key, params).await?,
            None => {
                record_fact_resolution(false);
                fact.calculate(params_or_empty(params), self.view()).await?
            }
        };

        let Some(path) = path else {
            return Ok(value);
        };
        if value.is_object() || value.is_array() {
            let resolved = self.inner.path_resolver.resolve(&value, path);
            debug!(fact = fact_id, path, value = %resolved, "almanac::fact_value 路径取值");
            Ok(resolved)
        } else {
            debug!(fact = fact_id, path, "almanac::fact_value 事实值不是对象，忽略路径");
            Ok(value)
        }
    }

    async fn cached_value(&self, fact: &Fact, key: String, params: Option<&Value>) -> Result<Value> {
        // 不能跨 await 持有缓存的强引用
        let future = {
            let Some(cache) = self.cache.upgrade() else {
                record_fact_resolution(false);
                return fact.calculate(params_or_empty(params), self.view()).await;
            };
            let existing = cache.get(&key).map(|entry| entry.value().clone());
            match existing {
                Some(future) => {
                    record_fact_resolution(true);
                    future
                }
                None => {
                    // 在锁外构造 future，并发插入时以先插入者为准
                    let future = fact
                        .calculate(params_or_empty(params), self.view())
                        .shared();
                    record_fact_resolution(false);
                    cache.entry(key).or_insert(future).value().clone()
                }
            }
        };
        future.await
    }

    // ==================== 事件与结果 ====================

    pub fn add_event(&self, event: Event, outcome: EventOutcome) {
        self.inner.events.lock().push((outcome, event));
    }

    /// 获取事件；`outcome` 为 None 时返回全部事件
    pub fn get_events(&self, outcome: Option<EventOutcome>) -> Vec<Event> {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|(o, _)| outcome.is_none_or(|wanted| *o == wanted))
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn add_result(&self, result: RuleResult) {
        self.inner.results.lock().push(result);
    }

    pub fn get_results(&self) -> Vec<RuleResult> {
        self.inner.results.lock().clone()
    }
}

impl fmt::Debug for Almanac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Almanac")
            .field("options", &self.inner.options)
            .field("facts", &self.inner.facts.len())
            .field("cached", &self.cache.upgrade().map_or(0, |cache| cache.len()))
            .finish()
    }
}

#[async_trait]
impl FactResolver for Almanac {
    async fn fact_value(
        &self,
        fact_id: &str,
        params: Option<&Value>,
        path: Option<&str>,
    ) -> Result<Value> {
        Almanac::fact_value(self, fact_id, params, path).await
    }

    fn fact_priority(&self, fact_id: &str) -> Option<i64> {
        self.get_fact(fact_id).map(|fact| fact.priority())
    }
}

fn params_or_empty(params: Option<&Value>) -> Value {
    params.cloned().unwrap_or_else(|| Value::Object(Map::new()))
}
