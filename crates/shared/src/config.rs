//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use crate::observability::ObservabilityConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 规则引擎配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 未定义的事实解析为 null 而不是报错
    pub allow_undefined_facts: bool,
    /// 触发事件前解析事件参数中的事实引用
    pub replace_facts_in_event_params: bool,
    /// 规则文件（JSON 数组）
    pub rules_path: Option<PathBuf>,
    /// 运行时事实文件（JSON 对象）
    pub facts_path: Option<PathBuf>,
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineSettings,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "rules-engine".to_string(),
            environment: "development".to_string(),
            engine: EngineSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（RULES__ 前缀，如 RULES__ENGINE__ALLOW_UNDEFINED_FACTS -> engine.allow_undefined_facts）
    ///
    /// 环境由 RULES_ENV 指定（默认 development），配置目录由 CONFIG_DIR 指定（默认 config）。
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("RULES_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            // 默认配置
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            // 加载默认配置文件
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // 加载环境特定配置
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            // 加载服务特定配置
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            // 环境变量覆盖（RULES__ENGINE__RULES_PATH -> engine.rules_path）
            .add_source(
                Environment::with_prefix("RULES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.service_name, "rules-engine");
        assert!(!config.engine.allow_undefined_facts);
        assert!(config.engine.rules_path.is_none());
        assert_eq!(config.observability.log_format, "pretty");
        assert!(!config.is_production());
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let config =
            AppConfig::load_from("rules-engine", "staging", Path::new("does-not-exist")).unwrap();
        assert_eq!(config.service_name, "rules-engine");
        assert_eq!(config.environment, "staging");
        assert!(!config.engine.replace_facts_in_event_params);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_environment_overrides() {
        // SAFETY: 仅本测试读写该变量
        unsafe {
            std::env::set_var("RULES__ENGINE__ALLOW_UNDEFINED_FACTS", "true");
        }

        let config =
            AppConfig::load_from("rules-engine", "production", Path::new("does-not-exist"))
                .unwrap();
        assert!(config.engine.allow_undefined_facts);
        assert!(config.is_production());

        unsafe {
            std::env::remove_var("RULES__ENGINE__ALLOW_UNDEFINED_FACTS");
        }
    }
}
