//! 规则引擎错误类型
//!
//! 构造错误在条件/规则创建时同步返回；求值错误在异步求值过程中沿组合节点向上传播，
//! 不会被当作逻辑上的 true/false 吞掉。

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    // ==================== 构造错误 ====================
    #[error("Condition: constructor options required")]
    MissingOptions,

    #[error("conditional \"if\" must have accompanying \"then\" block")]
    IfWithoutThen,

    #[error("\"if\" / \"then\" values must be objects")]
    IfThenNotObjects,

    #[error("\"not\" must be an object")]
    NotMustBeObject,

    #[error("\"{0}\" must be an array")]
    MustBeArray(&'static str),

    #[error("Condition: constructor \"{0}\" property required")]
    MissingProperty(&'static str),

    #[error("无效的条件: {0}")]
    InvalidCondition(String),

    #[error("无效的规则: {0}")]
    InvalidRule(String),

    // ==================== 求值错误 ====================
    #[error("pipe registry required")]
    PipeRegistryRequired,

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Unknown pipe: {0}")]
    UnknownPipe(String),

    #[error("cannot evaluate a boolean condition directly")]
    BooleanEvaluation,

    #[error("Undefined fact: {0}")]
    UndefinedFact(String),

    #[error("事实计算失败: {fact}: {message}")]
    FactEvaluation { fact: String, message: String },

    // ==================== 引擎错误 ====================
    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("JSON 序列化错误: {0}")]
    Json(String),
}

// serde_json::Error 不可 Clone，而同一事实的计算结果需要被多个等待者共享，
// 因此只保留错误信息
impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl RuleError {
    /// 构造事实计算错误
    pub fn fact(fact: impl Into<String>, message: impl ToString) -> Self {
        Self::FactEvaluation {
            fact: fact.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
