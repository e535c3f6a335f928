//! 规则引擎命令行
//!
//! 从配置指定的文件加载规则与运行时事实，执行一次引擎并把结果以 JSON 输出到 stdout。

use anyhow::{Context, Result};
use rules_engine::{Engine, EngineOptions, Rule};
use rules_shared::config::AppConfig;
use rules_shared::observability;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 统一加载配置：从 config/{service_name}.toml 加载，包含可观测性配置
    let config = AppConfig::load("rules-engine").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    observability::init(&config.observability)?;

    info!(environment = %config.environment, "Starting rules-engine...");

    let mut engine = Engine::with_options(EngineOptions {
        allow_undefined_facts: config.engine.allow_undefined_facts,
        replace_facts_in_event_params: config.engine.replace_facts_in_event_params,
    });

    match &config.engine.rules_path {
        Some(path) => {
            for rule in load_rules(path)? {
                engine.add_rule(rule);
            }
            info!("Loaded {} rules from {}", engine.rules().len(), path.display());
        }
        None => warn!("engine.rules_path 未配置，引擎中没有规则"),
    }

    let facts = match &config.engine.facts_path {
        Some(path) => load_facts(path)?,
        None => HashMap::new(),
    };

    engine.on_success(|event, _, result| {
        info!(
            rule = result.name.as_deref().unwrap_or("<unnamed>"),
            event = %event.event_type,
            "规则满足"
        );
    });

    let result = engine.run(facts).await.context("规则引擎运行失败")?;

    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    Ok(())
}

/// 读取规则文件（JSON 数组）
fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取规则文件 {}", path.display()))?;
    let rules: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("规则文件必须是 JSON 数组: {}", path.display()))?;

    rules
        .iter()
        .enumerate()
        .map(|(index, value)| {
            Rule::from_value(value).with_context(|| format!("第 {} 条规则无效", index))
        })
        .collect()
}

/// 读取运行时事实文件（JSON 对象）
fn load_facts(path: &Path) -> Result<HashMap<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取事实文件 {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("事实文件必须是 JSON 对象: {}", path.display()))
}
