use thiserror::Error;

/// 应用错误
#[derive(Error, Debug)]
pub enum AppError {
    /// 业务错误
    #[error("业务错误: {0}")]
    BizError(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    DbError(String),

    /// 网络传输错误,请求可能根本没到达交易所
    #[error("网络错误: {0}")]
    Transport(String),

    /// 交易所限流
    #[error("交易所限流: {0}")]
    RateLimited(String),

    /// 交易所业务拒绝,保留原始错误码与原文
    #[error("交易所API错误 code={code}: {msg}")]
    ExchangeApi { code: String, msg: String },

    /// 签名或凭证错误,重试无意义
    #[error("签名错误: {0}")]
    Signature(String),

    /// 数量或价格无法满足交易所精度规则
    #[error("精度错误: {0}")]
    Precision(String),

    /// 邮箱通信错误
    #[error("邮箱错误: {0}")]
    Mail(String),

    /// 内容解析错误(信号文本/响应体)
    #[error("解析失败: {0}")]
    Parse(String),

    /// 决策服务错误(超时/响应不可解析)
    #[error("决策服务错误: {0}")]
    Oracle(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl AppError {
    /// 只有幂等读操作允许对这类错误自动重试,下单/撤单一律不重试
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::RateLimited(_))
    }

    /// 交易所返回体里的原始错误文本,入库时保留原文
    pub fn raw_text(&self) -> String {
        match self {
            AppError::ExchangeApi { code, msg } => format!("[{}] {}", code, msg),
            other => other.to_string(),
        }
    }
}

/// 把任何错误转换为Error类型的结果
pub fn to_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> AppError {
    AppError::Unknown(err.to_string())
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<rbatis::Error> for AppError {
    fn from(err: rbatis::Error) -> Self {
        AppError::DbError(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::DbError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}
