//! 叶子条件评估器
//!
//! 解析左右两侧的值，依次应用管道，再调用操作符比较：
//!
//! ```text
//!   LHS                          OPER          RHS
//! <fact + params + path | pipes> <operator>  <value | fact + params + path | pipes>
//! ```
//!
//! 所有事实查询都经过 [`FactResolver`]，评估器本身不做任何缓存。

use crate::almanac::FactResolver;
use crate::condition::{Condition, ConditionValue, FactCondition, OperatorDescriptor};
use crate::error::{Result, RuleError};
use crate::operators::OperatorRegistry;
use crate::pipes::{PipeCall, PipeRegistry};
use serde_json::{Value, json};
use tracing::debug;

/// 单个叶子条件的评估结果
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEvaluation {
    pub result: bool,
    pub left_hand_side_value: Value,
    pub right_hand_side_value: Value,
    /// 原始操作符描述（可能带有取反包装）
    pub operator: OperatorDescriptor,
}

impl LeafEvaluation {
    pub fn to_json(&self) -> Value {
        json!({
            "result": self.result,
            "leftHandSideValue": self.left_hand_side_value,
            "rightHandSideValue": self.right_hand_side_value,
            "operator": self.operator.to_json(),
        })
    }
}

impl FactCondition {
    /// 评估叶子条件
    ///
    /// # Arguments
    /// * `almanac` - 事实解析器（负责缓存）
    /// * `operators` - 操作符注册表
    /// * `pipes` - 管道注册表，条件声明了管道时必须提供
    pub async fn evaluate<R>(
        &self,
        almanac: &R,
        operators: &OperatorRegistry,
        pipes: Option<&PipeRegistry>,
    ) -> Result<LeafEvaluation>
    where
        R: FactResolver + ?Sized,
    {
        if pipes.is_none() && self.has_pipes() {
            return Err(RuleError::PipeRegistryRequired);
        }

        let descriptor = self.operator();
        let operator = operators
            .get(descriptor.name())
            .ok_or_else(|| RuleError::UnknownOperator(descriptor.name().to_string()))?;

        let (right_hand_side_value, left_hand_side_value) = futures::try_join!(
            resolve_compare_value(self.value(), almanac, pipes),
            async {
                let value = almanac
                    .fact_value(self.fact(), self.params(), self.path())
                    .await?;
                apply_pipes(value, self.pipes(), pipes)
            }
        )?;

        let mut result = operator.evaluate(&left_hand_side_value, &right_hand_side_value);
        if descriptor.is_negated() {
            result = !result;
        }

        debug!(
            "condition::evaluate <{} {} {}?> ({})",
            left_hand_side_value, descriptor, right_hand_side_value, result
        );

        Ok(LeafEvaluation {
            result,
            left_hand_side_value,
            right_hand_side_value,
            operator: descriptor.clone(),
        })
    }
}

impl Condition {
    /// 直接评估叶子条件；布尔节点只能通过 [`crate::executor::ConditionExecutor`] 评估
    pub async fn evaluate<R>(
        &self,
        almanac: &R,
        operators: &OperatorRegistry,
        pipes: Option<&PipeRegistry>,
    ) -> Result<LeafEvaluation>
    where
        R: FactResolver + ?Sized,
    {
        match self {
            Self::Fact(leaf) => leaf.evaluate(almanac, operators, pipes).await,
            Self::Boolean(_) => Err(RuleError::BooleanEvaluation),
        }
    }
}

/// 右值：字面量原样返回；`{fact: ...}` 通过事实解析器获取并应用其管道
async fn resolve_compare_value<R>(
    value: &ConditionValue,
    almanac: &R,
    pipes: Option<&PipeRegistry>,
) -> Result<Value>
where
    R: FactResolver + ?Sized,
{
    match value {
        ConditionValue::Literal(literal) => Ok(literal.clone()),
        ConditionValue::Fact(reference) => {
            let resolved = almanac
                .fact_value(
                    &reference.fact,
                    reference.params.as_ref(),
                    reference.path.as_deref(),
                )
                .await?;
            apply_pipes(resolved, reference.pipes.as_deref(), pipes)
        }
    }
}

fn apply_pipes(
    value: Value,
    steps: Option<&[PipeCall]>,
    pipes: Option<&PipeRegistry>,
) -> Result<Value> {
    match steps {
        None | Some([]) => Ok(value),
        Some(steps) => pipes
            .ok_or(RuleError::PipeRegistryRequired)?
            .apply(value, steps),
    }
}
