//! 比较操作符注册表
//!
//! 操作符是按名称注册的二元谓词 `(factValue, compareValue) -> bool`，
//! 可选地带有对 `factValue` 的校验器。校验失败时操作符直接返回 false。

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 操作符求值函数
pub type OperatorEvaluator = dyn Fn(&Value, &Value) -> bool + Send + Sync;

/// 事实值校验函数
pub type FactValueValidator = dyn Fn(&Value) -> bool + Send + Sync;

/// 比较操作符
#[derive(Clone)]
pub struct Operator {
    name: String,
    evaluator: Arc<OperatorEvaluator>,
    validator: Option<Arc<FactValueValidator>>,
}

impl Operator {
    pub fn new<F>(name: impl Into<String>, evaluator: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            evaluator: Arc::new(evaluator),
            validator: None,
        }
    }

    /// 附加事实值校验器
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 评估操作符
    ///
    /// # Arguments
    /// * `fact_value` - 解析（并经过管道转换）后的左值
    /// * `compare_value` - 条件中定义或由事实解析出的右值
    pub fn evaluate(&self, fact_value: &Value, compare_value: &Value) -> bool {
        if let Some(validator) = &self.validator {
            if !validator(fact_value) {
                return false;
            }
        }
        (self.evaluator)(fact_value, compare_value)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// 操作符注册表
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<Operator>>,
}

impl OperatorRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建包含内置操作符的注册表
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for operator in default_operators() {
            registry.register(operator);
        }
        registry
    }

    /// 注册操作符，同名操作符会被替换
    pub fn register(&mut self, operator: Operator) {
        self.operators
            .insert(operator.name().to_string(), Arc::new(operator));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.operators.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Operator> {
        self.operators.get(name).map(|op| op.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// 已注册的操作符名称（按字母序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.names())
            .finish()
    }
}

/// 内置操作符
pub fn default_operators() -> Vec<Operator> {
    vec![
        // 通用比较
        Operator::new("equal", equal),
        Operator::new("notEqual", |a, b| !equal(a, b)),
        // 包含检查
        Operator::new("in", in_list),
        Operator::new("notIn", |a, b| !in_list(a, b)),
        Operator::new("contains", contains).with_validator(Value::is_array),
        Operator::new("doesNotContain", |a, b| !contains(a, b)).with_validator(Value::is_array),
        Operator::new("containsAny", contains_any).with_validator(Value::is_array),
        Operator::new("containsAll", contains_all).with_validator(Value::is_array),
        // 数值比较
        Operator::new("lessThan", |a, b| compare(a, b, |x, y| x < y)).with_validator(Value::is_number),
        Operator::new("lessThanInclusive", |a, b| compare(a, b, |x, y| x <= y))
            .with_validator(Value::is_number),
        Operator::new("greaterThan", |a, b| compare(a, b, |x, y| x > y))
            .with_validator(Value::is_number),
        Operator::new("greaterThanInclusive", |a, b| compare(a, b, |x, y| x >= y))
            .with_validator(Value::is_number),
        Operator::new("between", between).with_validator(Value::is_number),
        // 字符串操作
        Operator::new("startsWith", |a, b| match (a.as_str(), b.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        })
        .with_validator(Value::is_string),
        Operator::new("endsWith", |a, b| match (a.as_str(), b.as_str()) {
            (Some(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        })
        .with_validator(Value::is_string),
        {
            let patterns = Arc::new(RegexCache::default());
            Operator::new("matches", move |a, b| patterns.is_match(a, b))
                .with_validator(Value::is_string)
        },
        // 时间操作
        Operator::new("before", |a, b| time_compare(a, b, |x, y| x < y)),
        Operator::new("after", |a, b| time_compare(a, b, |x, y| x > y)),
    ]
}

/// 相等比较
///
/// 数值统一按浮点比较，避免 100 与 100.0 不相等
fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare<F>(a: &Value, b: &Value, cmp: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

/// expected 应为 [min, max] 数组，两端均包含
fn between(a: &Value, b: &Value) -> bool {
    let Some([min, max]) = b.as_array().map(Vec::as_slice) else {
        return false;
    };
    match (a.as_f64(), min.as_f64(), max.as_f64()) {
        (Some(x), Some(min), Some(max)) => x >= min && x <= max,
        _ => false,
    }
}

fn in_list(a: &Value, b: &Value) -> bool {
    b.as_array()
        .is_some_and(|items| items.iter().any(|item| equal(a, item)))
}

fn contains(a: &Value, b: &Value) -> bool {
    a.as_array()
        .is_some_and(|items| items.iter().any(|item| equal(item, b)))
}

fn contains_any(a: &Value, b: &Value) -> bool {
    match (a.as_array(), b.as_array()) {
        (Some(field), Some(expected)) => expected
            .iter()
            .any(|e| field.iter().any(|f| equal(f, e))),
        _ => false,
    }
}

fn contains_all(a: &Value, b: &Value) -> bool {
    match (a.as_array(), b.as_array()) {
        (Some(field), Some(expected)) => expected
            .iter()
            .all(|e| field.iter().any(|f| equal(f, e))),
        _ => false,
    }
}

/// 已编译正则的缓存上限，超出时整体清空
const REGEX_CACHE_CAPACITY: usize = 256;

/// `matches` 操作符的编译缓存，随操作符注册表一起释放
#[derive(Default)]
struct RegexCache {
    patterns: DashMap<String, Regex>,
}

impl RegexCache {
    fn is_match(&self, a: &Value, b: &Value) -> bool {
        let (Some(s), Some(pattern)) = (a.as_str(), b.as_str()) else {
            return false;
        };

        if let Some(regex) = self.patterns.get(pattern) {
            return regex.is_match(s);
        }

        match Regex::new(pattern) {
            Ok(regex) => {
                let matched = regex.is_match(s);
                if self.patterns.len() >= REGEX_CACHE_CAPACITY {
                    self.patterns.clear();
                }
                self.patterns.insert(pattern.to_string(), regex);
                matched
            }
            Err(e) => {
                tracing::warn!(pattern, error = %e, "无效的正则表达式");
                false
            }
        }
    }
}

fn time_compare<F>(a: &Value, b: &Value, cmp: F) -> bool
where
    F: Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
{
    match (parse_datetime(a), parse_datetime(b)) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

/// 解析 RFC 3339 时间或 `YYYY-MM-DD` 日期
fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(name: &str, fact: Value, compare: Value) -> bool {
        let registry = OperatorRegistry::with_defaults();
        registry.get(name).unwrap().evaluate(&fact, &compare)
    }

    #[test]
    fn test_equal_numbers() {
        assert!(eval("equal", json!(100), json!(100)));
        assert!(eval("equal", json!(100.0), json!(100)));
        assert!(!eval("equal", json!("100"), json!(100)));
    }

    #[test]
    fn test_equal_strings() {
        assert!(eval("equal", json!("hello"), json!("hello")));
        assert!(!eval("equal", json!("hello"), json!("world")));
        assert!(eval("notEqual", json!("hello"), json!("world")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("greaterThan", json!(100), json!(50)));
        assert!(eval("greaterThanInclusive", json!(100), json!(100)));
        assert!(eval("lessThan", json!(50), json!(100)));
        assert!(eval("lessThanInclusive", json!(100), json!(100)));
        assert!(!eval("lessThan", json!(100), json!(100)));
    }

    #[test]
    fn test_numeric_validator_rejects_non_numbers() {
        // 校验失败时返回 false，而不是报错
        assert!(!eval("lessThan", json!("25"), json!(50)));
        assert!(!eval("greaterThan", json!(null), json!(0)));
    }

    #[test]
    fn test_between() {
        assert!(eval("between", json!(50), json!([0, 100])));
        assert!(!eval("between", json!(150), json!([0, 100])));
        assert!(!eval("between", json!(50), json!([0])));
    }

    #[test]
    fn test_in_list() {
        assert!(eval("in", json!("a"), json!(["a", "b", "c"])));
        assert!(!eval("in", json!("d"), json!(["a", "b", "c"])));
        assert!(eval("notIn", json!("d"), json!(["a", "b", "c"])));
        assert!(!eval("in", json!("a"), json!("abc")));
    }

    #[test]
    fn test_contains_array() {
        assert!(eval("contains", json!(["a", "b", "c"]), json!("b")));
        assert!(eval("doesNotContain", json!(["a", "b", "c"]), json!("x")));
        // 非数组事实值被校验器拒绝
        assert!(!eval("contains", json!("abc"), json!("b")));
        assert!(!eval("doesNotContain", json!("abc"), json!("x")));
    }

    #[test]
    fn test_contains_any() {
        assert!(eval("containsAny", json!(["a", "b", "c"]), json!(["b", "d"])));
        assert!(!eval("containsAny", json!(["a", "b", "c"]), json!(["x", "y"])));
    }

    #[test]
    fn test_contains_all() {
        assert!(eval("containsAll", json!(["a", "b", "c"]), json!(["a", "b"])));
        assert!(!eval("containsAll", json!(["a", "b", "c"]), json!(["a", "d"])));
    }

    #[test]
    fn test_string_prefix_suffix() {
        assert!(eval("startsWith", json!("hello world"), json!("hello")));
        assert!(eval("endsWith", json!("hello world"), json!("world")));
        assert!(!eval("startsWith", json!(42), json!("4")));
    }

    #[test]
    fn test_matches() {
        assert!(eval(
            "matches",
            json!("user@example.com"),
            json!(r"^[\w.-]+@[\w.-]+\.\w+$")
        ));
        assert!(!eval("matches", json!("user"), json!("[invalid")));
    }

    #[test]
    fn test_regex_cache_is_bounded() {
        let cache = RegexCache::default();
        for i in 0..REGEX_CACHE_CAPACITY * 2 + 1 {
            let pattern = json!(format!("^user-{}$", i));
            assert!(cache.is_match(&json!(format!("user-{}", i)), &pattern));
            assert!(cache.patterns.len() <= REGEX_CACHE_CAPACITY);
        }
        assert!(cache.patterns.len() >= 1);

        // 命中缓存与首次编译结果一致
        let pattern = json!("^a+$");
        assert!(cache.is_match(&json!("aaa"), &pattern));
        assert!(cache.is_match(&json!("aa"), &pattern));
        assert!(!cache.is_match(&json!("ab"), &pattern));
    }

    #[test]
    fn test_time_comparison() {
        assert!(eval(
            "before",
            json!("2024-01-15T10:00:00Z"),
            json!("2024-01-20T10:00:00Z")
        ));
        assert!(eval("after", json!("2024-01-20"), json!("2024-01-15T10:00:00Z")));
        assert!(!eval("after", json!("not a date"), json!("2024-01-15")));
    }

    #[test]
    fn test_registry_register_and_remove() {
        let mut registry = OperatorRegistry::new();
        assert!(registry.is_empty());

        registry.register(Operator::new("startsWithLetter", |a, b| {
            match (a.as_str(), b.as_str()) {
                (Some(s), Some(letter)) => s.starts_with(letter),
                _ => false,
            }
        }));

        assert!(registry.contains("startsWithLetter"));
        assert!(registry.get("startsWithLetter").unwrap().evaluate(&json!("apple"), &json!("a")));
        assert!(registry.remove("startsWithLetter"));
        assert!(!registry.remove("startsWithLetter"));
        assert!(registry.get("startsWithLetter").is_none());
    }

    #[test]
    fn test_default_names() {
        let names = OperatorRegistry::with_defaults().names();
        for expected in [
            "equal",
            "notEqual",
            "in",
            "notIn",
            "contains",
            "doesNotContain",
            "lessThan",
            "lessThanInclusive",
            "greaterThan",
            "greaterThanInclusive",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }
}
