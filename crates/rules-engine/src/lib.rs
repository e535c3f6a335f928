//! 规则条件引擎
//!
//! 提供声明式规则的条件评估能力，支持：
//! - JSON 条件树解析（`all` / `any` / `not` / `if-then`）与无损序列化
//! - 叶子条件的事实解析、管道转换与操作符比较（含操作符取反）
//! - 按优先级分组的短路调度
//! - 事实缓存、规则优先级调度与事件通知

pub mod almanac;
pub mod condition;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod fact;
pub mod operators;
pub mod pipes;
pub mod rule;

#[cfg(test)]
mod test_utils;

pub use almanac::{Almanac, AlmanacOptions, EventOutcome, FactResolver, JsonPathResolver, PathResolver};
pub use condition::{
    BooleanCondition, BooleanOperator, Condition, ConditionValue, FactCondition, FactReference,
    OperatorDescriptor,
};
pub use engine::{Engine, EngineOptions, EngineResult, EngineStatus};
pub use error::{Result, RuleError};
pub use evaluator::LeafEvaluation;
pub use executor::{ConditionExecutor, ConditionOutcome};
pub use fact::{Fact, FactOptions};
pub use operators::{Operator, OperatorRegistry};
pub use pipes::{Pipe, PipeCall, PipeRegistry};
pub use rule::{Event, Rule, RuleResult};
