use std::env;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber, Layer, Registry};

use crate::app_config;

// 文件写入线程的guard，进程存活期间必须持有
static LOG_GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

// ERROR级别事件转发告警邮件
struct AlertLayer {
    event_count: Arc<Mutex<u32>>,
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event, _: tracing_subscriber::layer::Context<S>) {
        let level = *event.metadata().level();
        if level != Level::ERROR {
            return;
        }
        let event_count = Arc::clone(&self.event_count);
        let event_message = format!("tracing log Event received: {:?}", event);
        tokio::spawn(async move {
            let mut count = event_count.lock().await;
            *count += 1;
            let email_title = "发生错误日志";
            let email_body = format!("发生错误日志内容:{}", event_message);
            app_config::email::send_email(email_title, email_body).await;
        });
    }
}

// 设置日志
pub async fn setup_logging() -> anyhow::Result<()> {
    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "LOCAL".to_string());

    if app_env == "LOCAL" {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_writer(std::io::stdout)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let info_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "info.log");
        let error_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "error.log");

        let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
        let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);
        let _ = LOG_GUARDS.set(vec![info_guard, error_guard]);

        let alert_layer = AlertLayer {
            event_count: Arc::new(Mutex::new(0)),
        };

        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_writer(info_non_blocking)
                    .with_filter(EnvFilter::new("info")),
            )
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_writer(error_non_blocking)
                    .with_filter(EnvFilter::new("error")),
            )
            .with(alert_layer);

        tracing::subscriber::set_global_default(subscriber)?;
    }

    // enable log crate to show sql logs
    if "true" == env::var("DB_DEBUG").unwrap_or_default() {
        fast_log::init(
            fast_log::Config::new()
                .console()
                .level(log::LevelFilter::Debug),
        )
        .expect("fast_log init error");
    }
    Ok(())
}
