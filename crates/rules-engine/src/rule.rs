//! 规则定义
//!
//! 规则 = 条件树根节点 + 条件满足时触发的事件，并带有引擎调度使用的优先级。

use crate::almanac::FactResolver;
use crate::condition::{Condition, DEFAULT_PRIORITY, FactReference, parse_priority, type_name};
use crate::error::{Result, RuleError};
use crate::executor::ConditionOutcome;
use crate::operators::OperatorRegistry;
use crate::pipes::PipeRegistry;
use futures::future::try_join_all;
use rules_shared::observability::metrics::record_rule_evaluation;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, instrument};

/// 规则触发的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }
}

/// 规则
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    name: Option<String>,
    priority: i64,
    conditions: Condition,
    event: Event,
}

impl Rule {
    /// 根条件必须是布尔节点
    pub fn new(conditions: Condition, event: Event) -> Result<Self> {
        if !conditions.is_boolean_operator() {
            return Err(RuleError::InvalidRule(
                "\"conditions\" root must contain a single instance of \"all\", \"any\", or \"not\""
                    .to_string(),
            ));
        }
        Ok(Self {
            name: None,
            priority: DEFAULT_PRIORITY,
            conditions,
            event,
        })
    }

    /// 从声明式结构构造规则
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(props) = value else {
            return Err(RuleError::InvalidRule(format!(
                "规则必须是对象，实际为 {}",
                type_name(value)
            )));
        };

        let conditions = props
            .get("conditions")
            .ok_or_else(|| RuleError::InvalidRule("\"conditions\" 属性必填".to_string()))?;
        let event = props
            .get("event")
            .ok_or_else(|| RuleError::InvalidRule("\"event\" 属性必填".to_string()))?;
        let event: Event = serde_json::from_value(event.clone())
            .map_err(|e| RuleError::InvalidRule(format!("无效的 event: {}", e)))?;

        let mut rule = Self::new(Condition::from_value(conditions)?, event)?;

        if let Some(priority) = props.get("priority") {
            rule = rule.with_priority(parse_priority(priority).unwrap_or(0))?;
        }
        match props.get("name") {
            None | Some(Value::Null) => {}
            Some(Value::String(name)) => rule.name = Some(name.clone()),
            Some(other) => rule.name = Some(other.to_string()),
        }

        Ok(rule)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Result<Self> {
        if priority <= 0 {
            return Err(RuleError::InvalidRule(
                "Priority must be greater than zero".to_string(),
            ));
        }
        self.priority = priority;
        Ok(self)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn conditions(&self) -> &Condition {
        &self.conditions
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn get_used_facts(&self) -> HashSet<String> {
        self.conditions.get_used_facts()
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("conditions".to_string(), self.conditions.to_json());
        map.insert("priority".to_string(), json!(self.priority));
        map.insert("event".to_string(), json!(self.event));
        if let Some(name) = &self.name {
            map.insert("name".to_string(), Value::String(name.clone()));
        }
        Value::Object(map)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// 评估规则条件
    #[instrument(skip_all, fields(rule = self.name.as_deref().unwrap_or("<unnamed>")))]
    pub async fn evaluate<R>(
        &self,
        almanac: &R,
        operators: &OperatorRegistry,
        pipes: Option<&PipeRegistry>,
    ) -> Result<RuleResult>
    where
        R: FactResolver + ?Sized,
    {
        let start = Instant::now();
        let conditions = self
            .conditions
            .evaluate_tree(almanac, operators, pipes)
            .await?;
        let result = conditions.passed();

        record_rule_evaluation(result, start.elapsed().as_secs_f64());
        debug!(result, "rule::evaluate 完成");

        Ok(RuleResult {
            name: self.name.clone(),
            priority: self.priority,
            event: self.event.clone(),
            conditions,
            result,
        })
    }
}

impl TryFrom<Value> for Rule {
    type Error = RuleError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_value(&value)
    }
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// 规则评估结果
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub name: Option<String>,
    pub priority: i64,
    pub event: Event,
    pub conditions: ConditionOutcome,
    pub result: bool,
}

impl RuleResult {
    /// 把事件参数中的 `{ "fact": ... }` 替换为解析后的事实值
    pub async fn resolve_event_params<R>(&mut self, almanac: &R) -> Result<()>
    where
        R: FactResolver + ?Sized,
    {
        let Some(params) = &mut self.event.params else {
            return Ok(());
        };

        let references = params
            .iter()
            .filter_map(|(key, value)| match value {
                Value::Object(map) if map.contains_key("fact") => {
                    Some(FactReference::parse(map).map(|reference| (key.clone(), reference)))
                }
                _ => None,
            })
            .collect::<Result<Vec<_>>>()?;

        let resolved = try_join_all(references.into_iter().map(|(key, reference)| async move {
            let value = almanac
                .fact_value(
                    &reference.fact,
                    reference.params.as_ref(),
                    reference.path.as_deref(),
                )
                .await?;
            Ok::<_, RuleError>((key, value))
        }))
        .await?;

        params.extend(resolved);
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("conditions".to_string(), self.conditions.to_json());
        map.insert("event".to_string(), json!(self.event));
        map.insert("priority".to_string(), json!(self.priority));
        map.insert("result".to_string(), Value::Bool(self.result));
        if let Some(name) = &self.name {
            map.insert("name".to_string(), Value::String(name.clone()));
        }
        Value::Object(map)
    }
}

impl Serialize for RuleResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
