use std::future::Future;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use crate::error::AppError;

/// 只给幂等读调用(余额/持仓/行情/规则)用的重试包装
///
/// 500ms起步指数退避带抖动,上限5秒,最多重试3次;
/// 是否可重试由错误分类决定,下单/撤单调用不允许走这里
pub async fn with_read_retry<T, F, Fut>(op_name: &str, mut action: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(std::time::Duration::from_secs(5))
        .map(jitter)
        .take(3);

    let op = op_name.to_string();
    RetryIf::spawn(
        strategy,
        || action(),
        |e: &AppError| {
            let retry = e.is_retryable_read();
            if retry {
                warn!("{} 读取失败将重试: {}", op, e);
            }
            retry
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_read_retry("test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Transport("timeout".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, AppError> = with_read_retry("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AppError::ExchangeApi {
                    code: "-1022".into(),
                    msg: "Signature for this request is not valid.".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, AppError> = with_read_retry("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::RateLimited("429".into())) }
        })
        .await;
        assert!(result.is_err());
        // 首次调用 + 3次重试
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
