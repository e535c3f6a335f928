//! 管道（值转换）注册表
//!
//! 管道在事实解析之后、操作符比较之前对值进行转换，按声明顺序从左到右依次执行。

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 管道转换函数 `(value, args) -> value`
pub type PipeEvaluator = dyn Fn(&Value, &[Value]) -> Value + Send + Sync;

/// 命名的值转换
#[derive(Clone)]
pub struct Pipe {
    name: String,
    evaluator: Arc<PipeEvaluator>,
}

impl Pipe {
    pub fn new<F>(name: impl Into<String>, evaluator: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            evaluator: Arc::new(evaluator),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, value: &Value, args: &[Value]) -> Value {
        (self.evaluator)(value, args)
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe").field("name", &self.name).finish()
    }
}

/// 条件中的一个管道步骤 `{ "name": ..., "args": [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl PipeCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// 管道注册表
#[derive(Clone, Default)]
pub struct PipeRegistry {
    pipes: HashMap<String, Arc<Pipe>>,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册管道，同名管道会被替换
    pub fn register(&mut self, pipe: Pipe) {
        self.pipes.insert(pipe.name().to_string(), Arc::new(pipe));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.pipes.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Pipe> {
        self.pipes.get(name).map(|pipe| pipe.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// 依次应用管道步骤，每一步的输出作为下一步的输入
    pub fn apply(&self, value: Value, steps: &[PipeCall]) -> Result<Value> {
        steps.iter().try_fold(value, |current, step| {
            let pipe = self
                .get(&step.name)
                .ok_or_else(|| RuleError::UnknownPipe(step.name.clone()))?;
            Ok(pipe.evaluate(&current, &step.args))
        })
    }
}

impl fmt::Debug for PipeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.pipes.keys().collect();
        names.sort();
        f.debug_struct("PipeRegistry").field("pipes", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arithmetic_pipes() -> PipeRegistry {
        let mut registry = PipeRegistry::new();
        registry.register(Pipe::new("double", |v, _| {
            json!(v.as_i64().unwrap_or_default() * 2)
        }));
        registry.register(Pipe::new("increment", |v, _| {
            json!(v.as_i64().unwrap_or_default() + 1)
        }));
        registry.register(Pipe::new("add", |v, args| {
            let n: i64 = args.iter().filter_map(Value::as_i64).sum();
            json!(v.as_i64().unwrap_or_default() + n)
        }));
        registry
    }

    #[test]
    fn test_apply_left_to_right() {
        let registry = arithmetic_pipes();

        let steps = vec![PipeCall::new("double"), PipeCall::new("increment")];
        assert_eq!(registry.apply(json!(3), &steps).unwrap(), json!(7));

        let reversed = vec![PipeCall::new("increment"), PipeCall::new("double")];
        assert_eq!(registry.apply(json!(3), &reversed).unwrap(), json!(8));
    }

    #[test]
    fn test_apply_passes_args() {
        let registry = arithmetic_pipes();
        let steps = vec![PipeCall::new("add").with_args(vec![json!(10), json!(5)])];
        assert_eq!(registry.apply(json!(1), &steps).unwrap(), json!(16));
    }

    #[test]
    fn test_apply_empty_pipeline_is_identity() {
        let registry = PipeRegistry::new();
        assert_eq!(registry.apply(json!("x"), &[]).unwrap(), json!("x"));
    }

    #[test]
    fn test_unknown_pipe() {
        let registry = arithmetic_pipes();
        let steps = vec![PipeCall::new("double"), PipeCall::new("triple")];

        let err = registry.apply(json!(3), &steps).unwrap_err();
        assert_eq!(err, RuleError::UnknownPipe("triple".to_string()));
        assert_eq!(err.to_string(), "Unknown pipe: triple");
    }

    #[test]
    fn test_pipe_call_deserialization() {
        let call: PipeCall = serde_json::from_value(json!({"name": "add", "args": [1]})).unwrap();
        assert_eq!(call, PipeCall::new("add").with_args(vec![json!(1)]));

        let bare: PipeCall = serde_json::from_value(json!({"name": "double"})).unwrap();
        assert!(bare.args.is_empty());
        assert_eq!(serde_json::to_value(&bare).unwrap(), json!({"name": "double"}));
    }
}
