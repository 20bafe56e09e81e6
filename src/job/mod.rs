pub mod signal_poll_job;
pub mod trader_eval_job;

pub use signal_poll_job::SignalPollJob;
pub use trader_eval_job::TraderEvalJob;
