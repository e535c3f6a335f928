//! 条件树
//!
//! 条件是一个递归的布尔表达式：要么是布尔组合节点（`all` / `any` / `not`），
//! 要么是叶子比较节点（`fact` `operator` `value`）。
//!
//! 条件从声明式 JSON 结构构造，构造完成后拓扑结构不再变化。
//! `{ "if": A, "then": B }` 在构造时被改写为
//! `{ "any": [ { "all": [A, B] }, { "not": A } ] }`。
//! `to_json` 的输出即为构造输入格式，可以原样重新加载。

use crate::error::{Result, RuleError};
use crate::pipes::PipeCall;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// 布尔节点默认优先级
pub const DEFAULT_PRIORITY: i64 = 1;

/// 布尔组合操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanOperator {
    All,
    Any,
    Not,
}

impl BooleanOperator {
    /// 识别顺序：同时出现多个键时，靠前的优先
    pub const PRECEDENCE: [BooleanOperator; 3] = [Self::All, Self::Any, Self::Not];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::Not => "not",
        }
    }

    /// 在声明式结构中查找布尔操作符键
    pub fn detect(properties: &Map<String, Value>) -> Option<Self> {
        Self::PRECEDENCE
            .into_iter()
            .find(|op| properties.contains_key(op.as_str()))
    }
}

impl fmt::Display for BooleanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 叶子条件的操作符描述
///
/// 既可以是操作符名称，也可以是 `{ "not": name }`，后者对操作符结果取反。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperatorDescriptor {
    Named(String),
    Negated(String),
}

impl OperatorDescriptor {
    /// 注册表中的操作符名称（去掉取反包装）
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) | Self::Negated(name) => name,
        }
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, Self::Negated(_))
    }

    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self::Named(name.clone())),
            Value::Object(map) => match map.get("not") {
                Some(Value::String(name)) => Ok(Self::Negated(name.clone())),
                _ => Err(RuleError::InvalidCondition(
                    "operator 对象必须为 {\"not\": <name>}".to_string(),
                )),
            },
            other => Err(RuleError::InvalidCondition(format!(
                "operator 必须是字符串或 {{\"not\": <name>}}，实际为 {}",
                type_name(other)
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Named(name) => Value::String(name.clone()),
            Self::Negated(name) => json!({ "not": name }),
        }
    }
}

impl From<&str> for OperatorDescriptor {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl fmt::Display for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Negated(name) => write!(f, "NOT {}", name),
        }
    }
}

/// 右值来自另一个事实：`{ "fact": ..., "params"?, "path"?, "pipes"? }`
#[derive(Debug, Clone, PartialEq)]
pub struct FactReference {
    pub fact: String,
    pub params: Option<Value>,
    pub path: Option<String>,
    pub pipes: Option<Vec<PipeCall>>,
}

impl FactReference {
    pub fn new(fact: impl Into<String>) -> Self {
        Self {
            fact: fact.into(),
            params: None,
            path: None,
            pipes: None,
        }
    }

    pub(crate) fn parse(map: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            fact: parse_fact_id(map)?,
            params: parse_params(map)?,
            path: parse_path(map)?,
            pipes: parse_pipes(map)?,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("fact".to_string(), Value::String(self.fact.clone()));
        write_optional_fields(&mut map, &self.params, &self.path, &self.pipes);
        Value::Object(map)
    }
}

/// 叶子条件的比较值
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Literal(Value),
    Fact(FactReference),
}

impl ConditionValue {
    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) if map.contains_key("fact") => {
                FactReference::parse(map).map(Self::Fact)
            }
            literal => Ok(Self::Literal(literal.clone())),
        }
    }

    /// 右值引用的事实 ID
    pub fn fact(&self) -> Option<&str> {
        match self {
            Self::Fact(reference) => Some(&reference.fact),
            Self::Literal(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Fact(reference) => reference.to_json(),
        }
    }
}

impl From<Value> for ConditionValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

/// 叶子比较节点：`<fact + params + path | pipes>  <operator>  <value>`
#[derive(Debug, Clone, PartialEq)]
pub struct FactCondition {
    fact: String,
    operator: OperatorDescriptor,
    value: ConditionValue,
    params: Option<Value>,
    path: Option<String>,
    pipes: Option<Vec<PipeCall>>,
    priority: Option<i64>,
    // 以下两个字段只在重新加载历史求值结果时出现，仅作记录
    fact_result: Option<Value>,
    result: Option<bool>,
}

impl FactCondition {
    pub fn new(
        fact: impl Into<String>,
        operator: impl Into<OperatorDescriptor>,
        value: impl Into<ConditionValue>,
    ) -> Self {
        Self {
            fact: fact.into(),
            operator: operator.into(),
            value: value.into(),
            params: None,
            path: None,
            pipes: None,
            priority: None,
            fact_result: None,
            result: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_pipes(mut self, pipes: Vec<PipeCall>) -> Self {
        self.pipes = Some(pipes);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    fn parse(props: &Map<String, Value>) -> Result<Self> {
        if !props.contains_key("fact") {
            return Err(RuleError::MissingProperty("fact"));
        }
        let operator = props
            .get("operator")
            .ok_or(RuleError::MissingProperty("operator"))?;
        let value = props
            .get("value")
            .ok_or(RuleError::MissingProperty("value"))?;

        Ok(Self {
            fact: parse_fact_id(props)?,
            operator: OperatorDescriptor::parse(operator)?,
            value: ConditionValue::parse(value)?,
            params: parse_params(props)?,
            path: parse_path(props)?,
            pipes: parse_pipes(props)?,
            // 叶子节点没有默认优先级，未设置时由事实定义的优先级决定
            priority: props.get("priority").and_then(parse_priority),
            fact_result: props.get("factResult").cloned(),
            result: props.get("result").and_then(Value::as_bool),
        })
    }

    pub fn fact(&self) -> &str {
        &self.fact
    }

    pub fn operator(&self) -> &OperatorDescriptor {
        &self.operator
    }

    pub fn value(&self) -> &ConditionValue {
        &self.value
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn pipes(&self) -> Option<&[PipeCall]> {
        self.pipes.as_deref()
    }

    /// 是否声明了至少一个管道步骤
    pub fn has_pipes(&self) -> bool {
        self.pipes.as_ref().is_some_and(|p| !p.is_empty())
            || matches!(&self.value, ConditionValue::Fact(r) if r.pipes.as_ref().is_some_and(|p| !p.is_empty()))
    }

    pub fn priority(&self) -> Option<i64> {
        self.priority
    }

    pub fn fact_result(&self) -> Option<&Value> {
        self.fact_result.as_ref()
    }

    pub fn result(&self) -> Option<bool> {
        self.result
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("operator".to_string(), self.operator.to_json());
        map.insert("value".to_string(), self.value.to_json());
        map.insert("fact".to_string(), Value::String(self.fact.clone()));
        if let Some(fact_result) = &self.fact_result {
            map.insert("factResult".to_string(), fact_result.clone());
        }
        if let Some(result) = self.result {
            map.insert("result".to_string(), Value::Bool(result));
        }
        write_optional_fields(&mut map, &self.params, &self.path, &self.pipes);
        if let Some(priority) = self.priority {
            map.insert("priority".to_string(), json!(priority));
        }
        Value::Object(map)
    }
}

/// 布尔节点的操作数
#[derive(Debug, Clone, PartialEq)]
pub enum Operands {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Operands {
    pub fn operator(&self) -> BooleanOperator {
        match self {
            Self::All(_) => BooleanOperator::All,
            Self::Any(_) => BooleanOperator::Any,
            Self::Not(_) => BooleanOperator::Not,
        }
    }

    /// 子条件；`not` 视为只有一个元素的序列
    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::All(conditions) | Self::Any(conditions) => conditions,
            Self::Not(condition) => std::slice::from_ref(condition.as_ref()),
        }
    }
}

/// 布尔组合节点
#[derive(Debug, Clone, PartialEq)]
pub struct BooleanCondition {
    priority: i64,
    operands: Operands,
}

impl BooleanCondition {
    pub fn new(operands: Operands) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            operands,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn operator(&self) -> BooleanOperator {
        self.operands.operator()
    }

    pub fn operands(&self) -> &Operands {
        &self.operands
    }

    pub fn conditions(&self) -> &[Condition] {
        self.operands.conditions()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("priority".to_string(), json!(self.priority));
        let operands = match &self.operands {
            Operands::All(conditions) | Operands::Any(conditions) => {
                Value::Array(conditions.iter().map(Condition::to_json).collect())
            }
            Operands::Not(condition) => condition.to_json(),
        };
        map.insert(self.operator().as_str().to_string(), operands);
        Value::Object(map)
    }
}

/// 条件节点
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Boolean(BooleanCondition),
    Fact(FactCondition),
}

impl Condition {
    /// 从声明式结构构造条件树
    pub fn from_value(properties: &Value) -> Result<Self> {
        let props = match properties {
            Value::Null => return Err(RuleError::MissingOptions),
            Value::Object(map) => map,
            other => {
                return Err(RuleError::InvalidCondition(format!(
                    "条件必须是对象，实际为 {}",
                    type_name(other)
                )));
            }
        };

        if props.contains_key("if") {
            let desugared = desugar_if_then(props)?;
            return Self::from_object(&desugared);
        }

        Self::from_object(props)
    }

    fn from_object(props: &Map<String, Value>) -> Result<Self> {
        let Some(operator) = BooleanOperator::detect(props) else {
            return FactCondition::parse(props).map(Self::Fact);
        };

        let operand = &props[operator.as_str()];
        let operands = match operator {
            BooleanOperator::Not => {
                if operand.is_array() {
                    return Err(RuleError::NotMustBeObject);
                }
                Operands::Not(Box::new(Self::from_value(operand)?))
            }
            BooleanOperator::All => Operands::All(Self::parse_list(operator, operand)?),
            BooleanOperator::Any => Operands::Any(Self::parse_list(operator, operand)?),
        };

        // 布尔节点总有优先级，缺省（或为 0 / 非数值）时为 1
        let priority = props
            .get("priority")
            .and_then(parse_priority)
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_PRIORITY);

        Ok(Self::Boolean(BooleanCondition { priority, operands }))
    }

    fn parse_list(operator: BooleanOperator, operand: &Value) -> Result<Vec<Self>> {
        operand
            .as_array()
            .ok_or(RuleError::MustBeArray(operator.as_str()))?
            .iter()
            .map(Self::from_value)
            .collect()
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::Boolean(BooleanCondition::new(Operands::All(conditions)))
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Boolean(BooleanCondition::new(Operands::Any(conditions)))
    }

    pub fn not(condition: Condition) -> Self {
        Self::Boolean(BooleanCondition::new(Operands::Not(Box::new(condition))))
    }

    /// 布尔操作符；叶子节点返回 None
    pub fn boolean_operator(&self) -> Option<BooleanOperator> {
        match self {
            Self::Boolean(node) => Some(node.operator()),
            Self::Fact(_) => None,
        }
    }

    pub fn is_boolean_operator(&self) -> bool {
        self.boolean_operator().is_some()
    }

    /// 显式设置的优先级（布尔节点总是有值）
    pub fn priority(&self) -> Option<i64> {
        match self {
            Self::Boolean(node) => Some(node.priority()),
            Self::Fact(leaf) => leaf.priority(),
        }
    }

    /// 条件树中引用的全部事实 ID（包括右值中引用的事实）
    pub fn get_used_facts(&self) -> HashSet<String> {
        let mut facts = HashSet::new();
        self.collect_facts(&mut facts);
        facts
    }

    fn collect_facts(&self, facts: &mut HashSet<String>) {
        match self {
            Self::Boolean(node) => {
                for child in node.conditions() {
                    child.collect_facts(facts);
                }
            }
            Self::Fact(leaf) => {
                facts.insert(leaf.fact.clone());
                if let Some(fact) = leaf.value.fact() {
                    facts.insert(fact.to_string());
                }
            }
        }
    }

    /// 转换为可重新加载的 JSON 结构
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(node) => node.to_json(),
            Self::Fact(leaf) => leaf.to_json(),
        }
    }

    /// 转换为 JSON 字符串
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

impl TryFrom<Value> for Condition {
    type Error = RuleError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

impl FromStr for Condition {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_value(&value)
    }
}

impl From<&Condition> for Value {
    fn from(condition: &Condition) -> Self {
        condition.to_json()
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// `{if, then}` → `{any: [{all: [if, then]}, {not: if}]}`
fn desugar_if_then(props: &Map<String, Value>) -> Result<Map<String, Value>> {
    let then = props.get("then").ok_or(RuleError::IfWithoutThen)?;
    let condition = &props["if"];
    if !condition.is_object() || !then.is_object() {
        return Err(RuleError::IfThenNotObjects);
    }

    let mut desugared = Map::new();
    desugared.insert(
        "any".to_string(),
        json!([
            { "all": [condition, then] },
            { "not": condition },
        ]),
    );
    Ok(desugared)
}

/// 与 `parseInt` 一致：数值取整，字符串取前导整数，其他情况视为未设置
pub(crate) fn parse_priority(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => {
            let s = s.trim_start();
            let (sign, rest) = match s.strip_prefix('-') {
                Some(rest) => (-1, rest),
                None => (1, s.strip_prefix('+').unwrap_or(s)),
            };
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            rest[..end].parse::<i64>().ok().map(|n| sign * n)
        }
        _ => None,
    }
}

fn parse_fact_id(map: &Map<String, Value>) -> Result<String> {
    match map.get("fact") {
        Some(Value::String(fact)) => Ok(fact.clone()),
        Some(other) => Err(RuleError::InvalidCondition(format!(
            "\"fact\" 必须是字符串，实际为 {}",
            type_name(other)
        ))),
        None => Err(RuleError::MissingProperty("fact")),
    }
}

fn parse_params(map: &Map<String, Value>) -> Result<Option<Value>> {
    match map.get("params") {
        None | Some(Value::Null) => Ok(None),
        Some(params @ Value::Object(_)) => Ok(Some(params.clone())),
        Some(other) => Err(RuleError::InvalidCondition(format!(
            "\"params\" 必须是对象，实际为 {}",
            type_name(other)
        ))),
    }
}

fn parse_path(map: &Map<String, Value>) -> Result<Option<String>> {
    match map.get("path") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(path)) => Ok(Some(path.clone())),
        Some(other) => Err(RuleError::InvalidCondition(format!(
            "\"path\" 必须是字符串，实际为 {}",
            type_name(other)
        ))),
    }
}

fn parse_pipes(map: &Map<String, Value>) -> Result<Option<Vec<PipeCall>>> {
    match map.get("pipes") {
        None | Some(Value::Null) => Ok(None),
        Some(pipes @ Value::Array(_)) => serde_json::from_value(pipes.clone())
            .map(Some)
            .map_err(|e| RuleError::InvalidCondition(format!("无效的 pipes: {}", e))),
        Some(_) => Err(RuleError::InvalidCondition(
            "pipes must be an array".to_string(),
        )),
    }
}

fn write_optional_fields(
    map: &mut Map<String, Value>,
    params: &Option<Value>,
    path: &Option<String>,
    pipes: &Option<Vec<PipeCall>>,
) {
    if let Some(params) = params {
        map.insert("params".to_string(), params.clone());
    }
    if let Some(path) = path {
        map.insert("path".to_string(), Value::String(path.clone()));
    }
    if let Some(pipes) = pipes {
        map.insert(
            "pipes".to_string(),
            Value::Array(
                pipes
                    .iter()
                    .map(|p| serde_json::to_value(p).unwrap_or(Value::Null))
                    .collect(),
            ),
        );
    }
}

/// 获取值的类型名称
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
