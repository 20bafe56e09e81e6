use anyhow::Result;
use clap::Parser;
use signal_quant::app::bootstrap;
use signal_quant::app_config::{db, log as app_log};
use tracing::info;

/// 邮件信号驱动的永续合约交易机器人
#[derive(Parser, Debug)]
#[command(name = "signal_quant", version, about = "邮件信号驱动的永续合约交易机器人")]
struct Cli {
    /// 模拟盘模式,等价于 PAPER_TRADING=true
    #[arg(long)]
    paper: bool,

    /// 启动时回填历史K线,等价于 IS_RUN_SYNC_DATA_JOB=true
    #[arg(long)]
    sync_data: bool,

    /// 打开行情长连接,等价于 IS_OPEN_SOCKET=true
    #[arg(long)]
    open_socket: bool,

    /// 运行策略评估,等价于 IS_RUN_REAL_STRATEGY=true
    #[arg(long)]
    run_strategy: bool,

    /// 轮询邮箱信号,等价于 IS_POLL_SIGNALS=true
    #[arg(long)]
    poll_signals: bool,

    /// 指定env文件路径,默认读取当前目录 .env
    #[arg(long)]
    env_file: Option<String>,
}

/// 命令行开关只在对应环境变量未设置时生效,env优先
fn apply_flag(flag: bool, key: &str) {
    if flag && std::env::var(key).is_err() {
        std::env::set_var(key, "true");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenv::from_filename(path).ok();
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    apply_flag(cli.paper, "PAPER_TRADING");
    apply_flag(cli.sync_data, "IS_RUN_SYNC_DATA_JOB");
    apply_flag(cli.open_socket, "IS_OPEN_SOCKET");
    apply_flag(cli.run_strategy, "IS_RUN_REAL_STRATEGY");
    apply_flag(cli.poll_signals, "IS_POLL_SIGNALS");

    app_log::setup_logging().await?;
    db::init_db().await;

    info!("signal_quant 启动");
    bootstrap::run().await
}
