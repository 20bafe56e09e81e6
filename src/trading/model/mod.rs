pub mod decision_record;
pub mod parsed_signal;
pub mod strategy_status;
pub mod trader_config;
