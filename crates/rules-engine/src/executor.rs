//! 条件树执行器
//!
//! 布尔节点的子条件按优先级分组（高优先级先执行），同一组内并发评估：
//! - `all`：某一组出现 false 时结果为 false，跳过其余低优先级组
//! - `any`：某一组出现 true 时结果为 true，跳过其余低优先级组
//! - `not`：完整评估唯一的子条件并取反
//!
//! 短路只跳过工作量，不改变结果；任一子条件的求值错误都会向上传播。
//! 执行结果写入独立的 [`ConditionOutcome`] 树，条件树本身保持只读，可被并发的多次运行共享。

use crate::almanac::FactResolver;
use crate::condition::{
    BooleanCondition, BooleanOperator, Condition, DEFAULT_PRIORITY, FactCondition, Operands,
};
use crate::error::Result;
use crate::evaluator::LeafEvaluation;
use crate::operators::OperatorRegistry;
use crate::pipes::PipeRegistry;
use futures::future::{BoxFuture, FutureExt, join_all};
use serde_json::{Map, Value, json};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::debug;

/// 单次运行的条件评估结果树
///
/// 结构与条件树一一对应；被短路跳过的节点 `result` 为 None。
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOutcome {
    Boolean {
        operator: BooleanOperator,
        priority: i64,
        result: Option<bool>,
        conditions: Vec<ConditionOutcome>,
    },
    Fact {
        condition: FactCondition,
        evaluation: Option<LeafEvaluation>,
    },
}

impl ConditionOutcome {
    /// 尚未评估的结果树
    pub fn pending(condition: &Condition) -> Self {
        match condition {
            Condition::Boolean(node) => Self::Boolean {
                operator: node.operator(),
                priority: node.priority(),
                result: None,
                conditions: node.conditions().iter().map(Self::pending).collect(),
            },
            Condition::Fact(leaf) => Self::Fact {
                condition: leaf.clone(),
                evaluation: None,
            },
        }
    }

    pub fn result(&self) -> Option<bool> {
        match self {
            Self::Boolean { result, .. } => *result,
            Self::Fact { evaluation, .. } => evaluation.as_ref().map(|e| e.result),
        }
    }

    pub fn passed(&self) -> bool {
        self.result() == Some(true)
    }

    /// 已评估的叶子节点（深度优先顺序）
    pub fn evaluations(&self) -> Vec<&LeafEvaluation> {
        let mut evaluations = Vec::new();
        self.collect_evaluations(&mut evaluations);
        evaluations
    }

    fn collect_evaluations<'a>(&'a self, out: &mut Vec<&'a LeafEvaluation>) {
        match self {
            Self::Boolean { conditions, .. } => {
                for child in conditions {
                    child.collect_evaluations(out);
                }
            }
            Self::Fact { evaluation, .. } => out.extend(evaluation.as_ref()),
        }
    }

    /// 与条件相同的 JSON 结构，附加 `result` 与 `factResult`
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean {
                operator,
                priority,
                result,
                conditions,
            } => {
                let mut map = Map::new();
                map.insert("priority".to_string(), json!(priority));
                let children = match operator {
                    BooleanOperator::Not => conditions
                        .first()
                        .map(Self::to_json)
                        .unwrap_or(Value::Null),
                    _ => Value::Array(conditions.iter().map(Self::to_json).collect()),
                };
                map.insert(operator.as_str().to_string(), children);
                if let Some(result) = result {
                    map.insert("result".to_string(), Value::Bool(*result));
                }
                Value::Object(map)
            }
            Self::Fact {
                condition,
                evaluation,
            } => {
                let mut value = condition.to_json();
                if let (Some(evaluation), Value::Object(map)) = (evaluation, &mut value) {
                    map.insert(
                        "factResult".to_string(),
                        evaluation.left_hand_side_value.clone(),
                    );
                    map.insert("result".to_string(), Value::Bool(evaluation.result));
                }
                value
            }
        }
    }
}

/// 条件树执行器
pub struct ConditionExecutor<'a, R: ?Sized> {
    almanac: &'a R,
    operators: &'a OperatorRegistry,
    pipes: Option<&'a PipeRegistry>,
}

impl<'a, R> ConditionExecutor<'a, R>
where
    R: FactResolver + ?Sized,
{
    pub fn new(
        almanac: &'a R,
        operators: &'a OperatorRegistry,
        pipes: Option<&'a PipeRegistry>,
    ) -> Self {
        Self {
            almanac,
            operators,
            pipes,
        }
    }

    /// 评估任意条件节点
    pub fn evaluate<'b>(&'b self, condition: &'b Condition) -> BoxFuture<'b, Result<ConditionOutcome>> {
        async move {
            match condition {
                Condition::Fact(leaf) => {
                    let evaluation = leaf
                        .evaluate(self.almanac, self.operators, self.pipes)
                        .await?;
                    Ok(ConditionOutcome::Fact {
                        condition: leaf.clone(),
                        evaluation: Some(evaluation),
                    })
                }
                Condition::Boolean(node) => self.evaluate_boolean(node).await,
            }
        }
        .boxed()
    }

    async fn evaluate_boolean(&self, node: &BooleanCondition) -> Result<ConditionOutcome> {
        let operator = node.operator();
        let (result, conditions) = match node.operands() {
            Operands::All(conditions) | Operands::Any(conditions) => {
                self.prioritize_and_run(conditions, operator).await?
            }
            Operands::Not(condition) => {
                let outcome = self.evaluate(condition).await?;
                (!outcome.passed(), vec![outcome])
            }
        };

        Ok(ConditionOutcome::Boolean {
            operator,
            priority: node.priority(),
            result: Some(result),
            conditions,
        })
    }

    /// 按优先级分组执行 `all` / `any`
    async fn prioritize_and_run(
        &self,
        conditions: &[Condition],
        operator: BooleanOperator,
    ) -> Result<(bool, Vec<ConditionOutcome>)> {
        let mut outcomes: Vec<ConditionOutcome> =
            conditions.iter().map(ConditionOutcome::pending).collect();

        // all: 遇到 false 停止；any: 遇到 true 停止
        let decisive = operator == BooleanOperator::Any;

        if conditions.is_empty() {
            return Ok((!decisive, outcomes));
        }

        for group in self.prioritize(conditions) {
            let evaluations =
                join_all(group.iter().map(|&index| self.evaluate(&conditions[index]))).await;

            let mut decided = false;
            for (&index, evaluation) in group.iter().zip(evaluations) {
                let outcome = evaluation?;
                decided |= outcome.passed() == decisive;
                outcomes[index] = outcome;
            }

            if decided {
                debug!(
                    operator = %operator,
                    result = decisive,
                    "prioritize_and_run: 结果已确定，跳过剩余低优先级条件"
                );
                return Ok((decisive, outcomes));
            }
        }

        Ok((!decisive, outcomes))
    }

    /// 子条件下标按优先级分组，高优先级在前
    fn prioritize(&self, conditions: &[Condition]) -> Vec<Vec<usize>> {
        let mut groups: BTreeMap<Reverse<i64>, Vec<usize>> = BTreeMap::new();
        for (index, condition) in conditions.iter().enumerate() {
            groups
                .entry(Reverse(self.priority_of(condition)))
                .or_default()
                .push(index);
        }
        groups.into_values().collect()
    }

    /// 条件自身优先级 > 事实定义的优先级 > 1，为 0 时视为未设置
    fn priority_of(&self, condition: &Condition) -> i64 {
        match condition {
            Condition::Boolean(node) => node.priority(),
            Condition::Fact(leaf) => leaf
                .priority()
                .filter(|p| *p != 0)
                .or_else(|| self.almanac.fact_priority(leaf.fact()).filter(|p| *p != 0))
                .unwrap_or(DEFAULT_PRIORITY),
        }
    }
}

impl Condition {
    /// 评估整棵条件树（布尔节点按优先级调度）
    pub async fn evaluate_tree<R>(
        &self,
        almanac: &R,
        operators: &OperatorRegistry,
        pipes: Option<&PipeRegistry>,
    ) -> Result<ConditionOutcome>
    where
        R: FactResolver + ?Sized,
    {
        ConditionExecutor::new(almanac, operators, pipes)
            .evaluate(self)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use crate::test_utils::StaticFacts;

    fn condition(value: Value) -> Condition {
        Condition::from_value(&value).unwrap()
    }

    fn run(condition: &Condition, facts: &StaticFacts) -> Result<ConditionOutcome> {
        let operators = OperatorRegistry::with_defaults();
        tokio_test::block_on(condition.evaluate_tree(facts, &operators, None))
    }

    fn age_under_50() -> Value {
        json!({ "fact": "age", "operator": "lessThan", "value": 50 })
    }

    #[test]
    fn test_single_leaf_and_not() {
        let leaf = condition(age_under_50());
        let negated = condition(json!({ "not": age_under_50() }));

        let young = StaticFacts::new().with("age", json!(25));
        let old = StaticFacts::new().with("age", json!(75));

        assert_eq!(run(&leaf, &young).unwrap().result(), Some(true));
        assert_eq!(run(&leaf, &old).unwrap().result(), Some(false));
        assert_eq!(run(&negated, &young).unwrap().result(), Some(false));
        assert_eq!(run(&negated, &old).unwrap().result(), Some(true));
    }

    #[test]
    fn test_any_scenario() {
        let any = condition(json!({
            "any": [
                age_under_50(),
                { "fact": "segment", "operator": "equal", "value": "european" },
            ],
        }));

        let european = StaticFacts::new()
            .with("age", json!(100))
            .with("segment", json!("european"));
        assert!(run(&any, &european).unwrap().passed());

        let american = StaticFacts::new()
            .with("age", json!(100))
            .with("segment", json!("north-american"));
        assert!(!run(&any, &american).unwrap().passed());
    }

    #[test]
    fn test_empty_combinators() {
        let facts = StaticFacts::new();
        assert_eq!(run(&condition(json!({ "all": [] })), &facts).unwrap().result(), Some(true));
        assert_eq!(run(&condition(json!({ "any": [] })), &facts).unwrap().result(), Some(false));
        assert!(facts.calls().is_empty());
    }

    #[test]
    fn test_all_short_circuits_lower_priority_groups() {
        let all = condition(json!({
            "all": [
                { "fact": "expensive", "operator": "equal", "value": true, "priority": 1 },
                { "fact": "age", "operator": "lessThan", "value": 50, "priority": 10 },
            ],
        }));
        let facts = StaticFacts::new().with("age", json!(75)).failing("expensive");

        let outcome = run(&all, &facts).unwrap();
        assert_eq!(outcome.result(), Some(false));
        assert!(!facts.was_called("expensive"));

        // 被跳过的子条件没有结果
        let ConditionOutcome::Boolean { conditions, .. } = &outcome else {
            panic!("expected boolean outcome");
        };
        assert_eq!(conditions[0].result(), None);
        assert_eq!(conditions[1].result(), Some(false));
    }

    #[test]
    fn test_any_short_circuits_lower_priority_groups() {
        let any = condition(json!({
            "any": [
                { "fact": "expensive", "operator": "equal", "value": true },
                { "fact": "age", "operator": "lessThan", "value": 50, "priority": 2 },
            ],
        }));
        let facts = StaticFacts::new().with("age", json!(25)).failing("expensive");

        assert!(run(&any, &facts).unwrap().passed());
        assert!(!facts.was_called("expensive"));
    }

    #[test]
    fn test_error_surfaces_when_not_short_circuited() {
        let all = condition(json!({
            "all": [
                { "fact": "expensive", "operator": "equal", "value": true, "priority": 1 },
                { "fact": "age", "operator": "lessThan", "value": 50, "priority": 10 },
            ],
        }));
        let facts = StaticFacts::new().with("age", json!(25)).failing("expensive");

        let err = run(&all, &facts).unwrap_err();
        assert!(matches!(err, RuleError::FactEvaluation { ref fact, .. } if fact == "expensive"));
    }

    #[test]
    fn test_error_in_same_group_is_not_masked() {
        // 同组内即使有 false，也不掩盖兄弟节点的错误
        let all = condition(json!({
            "all": [
                age_under_50(),
                { "fact": "expensive", "operator": "equal", "value": true },
            ],
        }));
        let facts = StaticFacts::new().with("age", json!(75)).failing("expensive");

        assert!(run(&all, &facts).is_err());
    }

    #[test]
    fn test_unknown_operator_propagates_through_combinators() {
        let tree = condition(json!({
            "any": [{ "not": { "fact": "age", "operator": "approximately", "value": 50 } }],
        }));
        let facts = StaticFacts::new().with("age", json!(25));

        let err = run(&tree, &facts).unwrap_err();
        assert_eq!(err, RuleError::UnknownOperator("approximately".to_string()));
    }

    #[test]
    fn test_fact_priority_governs_unprioritized_leaves() {
        let all = condition(json!({
            "all": [
                { "fact": "slow", "operator": "equal", "value": true },
                { "fact": "fast", "operator": "equal", "value": true },
            ],
        }));
        let facts = StaticFacts::new()
            .with("fast", json!(false))
            .with_priority("fast", 5)
            .failing("slow");

        assert_eq!(run(&all, &facts).unwrap().result(), Some(false));
        assert_eq!(facts.calls(), vec!["fast".to_string()]);
    }

    #[test]
    fn test_condition_priority_overrides_fact_priority() {
        let all = condition(json!({
            "all": [
                { "fact": "slow", "operator": "equal", "value": true, "priority": 9 },
                { "fact": "fast", "operator": "equal", "value": true },
            ],
        }));
        let facts = StaticFacts::new()
            .with("slow", json!(false))
            .with_priority("fast", 5)
            .failing("fast");

        assert_eq!(run(&all, &facts).unwrap().result(), Some(false));
        assert!(!facts.was_called("fast"));
    }

    #[test]
    fn test_zero_priority_falls_back_to_fact_priority() {
        let all = condition(json!({
            "all": [
                { "fact": "plain", "operator": "equal", "value": true },
                { "fact": "fast", "operator": "equal", "value": true, "priority": 0 },
            ],
        }));
        let facts = StaticFacts::new()
            .with("fast", json!(false))
            .with_priority("fast", 5)
            .failing("plain");

        assert_eq!(run(&all, &facts).unwrap().result(), Some(false));
        assert_eq!(facts.calls(), vec!["fast".to_string()]);

        // 没有事实优先级时回落到 1，与同级兄弟同组
        let facts = StaticFacts::new()
            .with("plain", json!(true))
            .with("fast", json!(false));
        let outcome = run(&all, &facts).unwrap();
        assert_eq!(outcome.result(), Some(false));
        assert_eq!(facts.calls().len(), 2);
    }

    #[test]
    fn test_groups_run_in_priority_order() {
        let all = condition(json!({
            "all": [
                { "fact": "c", "operator": "equal", "value": 1, "priority": 1 },
                { "fact": "a", "operator": "equal", "value": 1, "priority": 3 },
                { "fact": "b", "operator": "equal", "value": 1, "priority": 2 },
            ],
        }));
        let facts = StaticFacts::new()
            .with("a", json!(1))
            .with("b", json!(1))
            .with("c", json!(1));

        assert!(run(&all, &facts).unwrap().passed());
        assert_eq!(facts.calls(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_if_then_truth_table() {
        let rule = condition(json!({
            "if": { "fact": "enabled", "operator": "equal", "value": true },
            "then": age_under_50(),
        }));

        for (enabled, age, expected) in [
            (false, 25, true),
            (false, 75, true),
            (true, 25, true),
            (true, 75, false),
        ] {
            let facts = StaticFacts::new()
                .with("enabled", json!(enabled))
                .with("age", json!(age));
            assert_eq!(
                run(&rule, &facts).unwrap().passed(),
                expected,
                "enabled={} age={}",
                enabled,
                age
            );
        }
    }

    #[test]
    fn test_double_negation() {
        let inner = condition(age_under_50());
        let doubled = condition(json!({ "not": { "not": age_under_50() } }));

        for age in [0, 49, 50, 51, 100] {
            let facts = StaticFacts::new().with("age", json!(age));
            assert_eq!(run(&inner, &facts).unwrap().result(), run(&doubled, &facts).unwrap().result());
        }
    }

    #[test]
    fn test_all_any_duality() {
        let leaves = [
            json!({ "fact": "a", "operator": "equal", "value": true }),
            json!({ "fact": "b", "operator": "equal", "value": true }),
            json!({ "fact": "c", "operator": "equal", "value": true }),
        ];
        let negated: Vec<Value> = leaves.iter().map(|l| json!({ "not": l })).collect();

        let not_all = condition(json!({ "not": { "all": leaves } }));
        let any_not = condition(json!({ "any": negated }));
        let not_any = condition(json!({ "not": { "any": leaves } }));
        let all_not = condition(json!({ "all": negated }));

        for bits in 0..8u8 {
            let facts = || {
                StaticFacts::new()
                    .with("a", json!(bits & 1 != 0))
                    .with("b", json!(bits & 2 != 0))
                    .with("c", json!(bits & 4 != 0))
            };
            assert_eq!(run(&not_all, &facts()).unwrap().result(), run(&any_not, &facts()).unwrap().result());
            assert_eq!(run(&not_any, &facts()).unwrap().result(), run(&all_not, &facts()).unwrap().result());
        }
    }

    #[test]
    fn test_outcome_json() {
        let tree = condition(json!({ "all": [age_under_50()] }));
        let facts = StaticFacts::new().with("age", json!(25));

        let outcome = run(&tree, &facts).unwrap();
        assert_eq!(
            outcome.to_json(),
            json!({
                "priority": 1,
                "result": true,
                "all": [{
                    "fact": "age", "operator": "lessThan", "value": 50,
                    "factResult": 25, "result": true,
                }],
            })
        );
        assert_eq!(outcome.evaluations().len(), 1);

        // 评估不修改条件树
        assert_eq!(tree.to_json(), json!({ "priority": 1, "all": [age_under_50()] }));
    }

    #[test]
    fn test_pending_outcome() {
        let tree = condition(json!({ "not": age_under_50() }));
        let pending = ConditionOutcome::pending(&tree);
        assert_eq!(pending.result(), None);
        assert!(pending.evaluations().is_empty());
        assert_eq!(
            pending.to_json(),
            json!({ "priority": 1, "not": age_under_50() })
        );
    }
}
