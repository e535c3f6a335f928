//! 指标模块
//!
//! 基于 metrics 门面记录规则评估相关指标。
//! 库本身不安装 recorder，未安装时记录操作为空操作，由宿主进程决定导出方式。

/// 注册指标描述（出现在导出端的 HELP 注释中）
pub fn describe_metrics() {
    metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    metrics::describe_histogram!(
        "rule_evaluation_duration_seconds",
        "Rule evaluation duration in seconds"
    );

    metrics::describe_counter!(
        "fact_resolutions_total",
        "Total number of fact resolutions"
    );

    metrics::describe_counter!("engine_runs_total", "Total number of engine runs");
    metrics::describe_histogram!(
        "engine_run_duration_seconds",
        "Engine run duration in seconds"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录规则评估
#[inline]
pub fn record_rule_evaluation(matched: bool, duration_secs: f64) {
    metrics::counter!(
        "rule_evaluations_total",
        "matched" => matched.to_string()
    )
    .increment(1);

    metrics::histogram!("rule_evaluation_duration_seconds").record(duration_secs);
}

/// 记录事实解析，`cached` 表示命中了已有的计算结果
///
/// 事实 ID 由调用方定义，不作为标签。
#[inline]
pub fn record_fact_resolution(cached: bool) {
    metrics::counter!(
        "fact_resolutions_total",
        "cached" => cached.to_string()
    )
    .increment(1);
}

/// 记录引擎运行
#[inline]
pub fn record_engine_run(success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    metrics::counter!("engine_runs_total", "status" => status).increment(1);
    metrics::histogram!("engine_run_duration_seconds", "status" => status).record(duration_secs);
}
