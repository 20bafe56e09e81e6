pub mod gateway;
pub mod indicator;
pub mod market;
pub mod model;
pub mod signal;
pub mod strategy;
