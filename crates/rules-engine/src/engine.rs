//! 规则引擎
//!
//! 持有规则、操作符、管道与事实定义。每次 `run` 创建独立的 [`Almanac`]，
//! 按规则优先级从高到低分组执行，同组规则并发评估，
//! 评估结果写入事实簿并通知已注册的监听器。

use crate::almanac::{Almanac, AlmanacOptions, EventOutcome, JsonPathResolver, PathResolver};
use crate::error::{Result, RuleError};
use crate::fact::Fact;
use crate::operators::{Operator, OperatorRegistry};
use crate::pipes::{Pipe, PipeRegistry};
use crate::rule::{Event, Rule, RuleResult};
use futures::future::try_join_all;
use parking_lot::Mutex;
use rules_shared::observability::metrics::record_engine_run;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// 引擎选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// 未定义的事实解析为 null
    pub allow_undefined_facts: bool,
    /// 触发事件前解析事件参数中的事实引用
    pub replace_facts_in_event_params: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineStatus {
    Ready,
    Running,
    Finished,
}

/// 运行状态；`stop` 递增 `generation`，开始时记录的代数与之不同的运行视为已停止
#[derive(Debug)]
struct RunState {
    status: EngineStatus,
    active: usize,
    generation: u64,
}

/// 单次运行的句柄，释放时结束该次运行
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    generation: u64,
}

impl<'a> RunGuard<'a> {
    fn begin(state: &'a Mutex<RunState>) -> Self {
        let mut current = state.lock();
        current.active += 1;
        current.status = EngineStatus::Running;
        Self {
            state,
            generation: current.generation,
        }
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().generation != self.generation
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.state.lock();
        current.active = current.active.saturating_sub(1);
        if current.active == 0 {
            current.status = EngineStatus::Finished;
        }
    }
}

/// 事件监听器 `(event, almanac, rule_result)`
pub type EventHandler = dyn Fn(&Event, &Almanac, &RuleResult) + Send + Sync;

/// 单次运行的结果
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub events: Vec<Event>,
    pub failure_events: Vec<Event>,
    pub results: Vec<RuleResult>,
    pub failure_results: Vec<RuleResult>,
    pub almanac: Almanac,
}

impl EngineResult {
    pub fn to_json(&self) -> Value {
        json!({
            "events": self.events,
            "failureEvents": self.failure_events,
            "results": self.results.iter().map(RuleResult::to_json).collect::<Vec<_>>(),
            "failureResults": self.failure_results.iter().map(RuleResult::to_json).collect::<Vec<_>>(),
        })
    }
}

/// 规则引擎
pub struct Engine {
    rules: Vec<Arc<Rule>>,
    operators: OperatorRegistry,
    pipes: PipeRegistry,
    facts: HashMap<String, Arc<Fact>>,
    options: EngineOptions,
    path_resolver: Arc<dyn PathResolver>,
    success_handlers: Vec<Arc<EventHandler>>,
    failure_handlers: Vec<Arc<EventHandler>>,
    event_handlers: HashMap<String, Vec<Arc<EventHandler>>>,
    state: Mutex<RunState>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            rules: Vec::new(),
            operators: OperatorRegistry::with_defaults(),
            pipes: PipeRegistry::new(),
            facts: HashMap::new(),
            options,
            path_resolver: Arc::new(JsonPathResolver),
            success_handlers: Vec::new(),
            failure_handlers: Vec::new(),
            event_handlers: HashMap::new(),
            state: Mutex::new(RunState {
                status: EngineStatus::Ready,
                active: 0,
                generation: 0,
            }),
        }
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    // ==================== 规则管理 ====================

    pub fn add_rule(&mut self, rule: Rule) {
        debug!(rule = rule.name().unwrap_or("<unnamed>"), "engine::add_rule");
        self.rules.push(Arc::new(rule));
    }

    /// 从声明式结构添加规则
    pub fn add_rule_from_value(&mut self, value: &Value) -> Result<()> {
        let rule = Rule::from_value(value)?;
        self.add_rule(rule);
        Ok(())
    }

    /// 按名称替换已有规则
    pub fn update_rule(&mut self, rule: Rule) -> Result<()> {
        let name = rule.name().unwrap_or_default().to_string();
        let existing = self
            .rules
            .iter_mut()
            .find(|r| rule.name().is_some() && r.name() == rule.name())
            .ok_or(RuleError::RuleNotFound(name))?;
        *existing = Arc::new(rule);
        Ok(())
    }

    /// 按名称移除规则，返回是否移除了任何规则
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name() != Some(name));
        self.rules.len() != before
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    // ==================== 操作符 / 管道 / 事实 ====================

    pub fn add_operator(&mut self, operator: Operator) {
        self.operators.register(operator);
    }

    pub fn remove_operator(&mut self, name: &str) -> bool {
        self.operators.remove(name)
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    pub fn add_pipe(&mut self, pipe: Pipe) {
        self.pipes.register(pipe);
    }

    pub fn remove_pipe(&mut self, name: &str) -> bool {
        self.pipes.remove(name)
    }

    pub fn add_fact(&mut self, fact: Fact) {
        debug!(fact = fact.id(), "engine::add_fact");
        self.facts.insert(fact.id().to_string(), Arc::new(fact));
    }

    pub fn remove_fact(&mut self, fact_id: &str) -> bool {
        self.facts.remove(fact_id).is_some()
    }

    pub fn get_fact(&self, fact_id: &str) -> Option<Arc<Fact>> {
        self.facts.get(fact_id).cloned()
    }

    /// 全部规则引用的事实 ID
    pub fn get_used_facts(&self) -> HashSet<String> {
        self.rules.iter().flat_map(|rule| rule.get_used_facts()).collect()
    }

    pub fn set_path_resolver(&mut self, path_resolver: Arc<dyn PathResolver>) {
        self.path_resolver = path_resolver;
    }

    // ==================== 监听器 ====================

    pub fn on_success<F>(&mut self, handler: F)
    where
        F: Fn(&Event, &Almanac, &RuleResult) + Send + Sync + 'static,
    {
        self.success_handlers.push(Arc::new(handler));
    }

    pub fn on_failure<F>(&mut self, handler: F)
    where
        F: Fn(&Event, &Almanac, &RuleResult) + Send + Sync + 'static,
    {
        self.failure_handlers.push(Arc::new(handler));
    }

    /// 监听指定类型的事件（仅在规则满足时触发）
    pub fn on_event<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Event, &Almanac, &RuleResult) + Send + Sync + 'static,
    {
        self.event_handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    // ==================== 运行 ====================

    /// 停止所有进行中的运行，尚未执行的低优先级规则将被跳过
    ///
    /// 之后开始的运行不受影响。
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.status = EngineStatus::Finished;
    }

    /// 有运行进行中时为 Running
    pub fn status(&self) -> EngineStatus {
        self.state.lock().status
    }

    /// 使用运行时事实执行全部规则
    #[instrument(skip_all, fields(rules = self.rules.len()))]
    pub async fn run(&self, runtime_facts: HashMap<String, Value>) -> Result<EngineResult> {
        let start = Instant::now();
        let run = RunGuard::begin(&self.state);

        let almanac = Almanac::with_path_resolver(
            AlmanacOptions {
                allow_undefined_facts: self.options.allow_undefined_facts,
            },
            Arc::clone(&self.path_resolver),
        );
        for fact in self.facts.values() {
            almanac.add_fact(Arc::clone(fact));
        }
        for (fact_id, value) in runtime_facts {
            almanac.add_runtime_fact(fact_id, value);
        }

        let outcome = self.evaluate_rules(&almanac, &run).await;
        drop(run);
        record_engine_run(outcome.is_ok(), start.elapsed().as_secs_f64());
        outcome?;

        let (results, failure_results): (Vec<_>, Vec<_>) =
            almanac.get_results().into_iter().partition(|r| r.result);

        info!(
            passed = results.len(),
            failed = failure_results.len(),
            "engine::run 完成"
        );

        Ok(EngineResult {
            events: almanac.get_events(Some(EventOutcome::Success)),
            failure_events: almanac.get_events(Some(EventOutcome::Failure)),
            results,
            failure_results,
            almanac,
        })
    }

    async fn evaluate_rules(&self, almanac: &Almanac, run: &RunGuard<'_>) -> Result<()> {
        for group in self.prioritize_rules() {
            if run.is_stopped() {
                debug!("engine::run 已停止，跳过剩余规则");
                break;
            }

            let results = try_join_all(
                group
                    .iter()
                    .map(|rule| rule.evaluate(almanac, &self.operators, Some(&self.pipes))),
            )
            .await?;

            for mut result in results {
                // 评估期间被停止时不再触发事件
                if run.is_stopped() {
                    break;
                }
                if self.options.replace_facts_in_event_params {
                    result.resolve_event_params(almanac).await?;
                }
                self.emit(almanac, result);
            }
        }
        Ok(())
    }

    fn emit(&self, almanac: &Almanac, result: RuleResult) {
        let outcome = if result.result {
            EventOutcome::Success
        } else {
            EventOutcome::Failure
        };
        debug!(
            rule = result.name.as_deref().unwrap_or("<unnamed>"),
            event = %result.event.event_type,
            ?outcome,
            "engine::emit"
        );

        let handlers = match outcome {
            EventOutcome::Success => &self.success_handlers,
            EventOutcome::Failure => &self.failure_handlers,
        };
        for handler in handlers {
            handler(&result.event, almanac, &result);
        }
        if outcome == EventOutcome::Success {
            for handler in self
                .event_handlers
                .get(&result.event.event_type)
                .into_iter()
                .flatten()
            {
                handler(&result.event, almanac, &result);
            }
        }

        almanac.add_event(result.event.clone(), outcome);
        almanac.add_result(result);
    }

    /// 规则按优先级分组，高优先级在前
    fn prioritize_rules(&self) -> Vec<Vec<Arc<Rule>>> {
        let mut groups: BTreeMap<Reverse<i64>, Vec<Arc<Rule>>> = BTreeMap::new();
        for rule in &self.rules {
            groups
                .entry(Reverse(rule.priority()))
                .or_default()
                .push(Arc::clone(rule));
        }
        groups.into_values().collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("rules", &self.rules.len())
            .field("operators", &self.operators.names())
            .field("pipes", &self.pipes)
            .field("facts", &self.facts.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("status", &self.status())
            .finish()
    }
}
