pub mod data_fetch;
pub mod execution;
pub mod indicator;
pub mod position_monitor;
pub mod strategy_eval;

pub use data_fetch::{DataFetchConfig, DataFetchService};
pub use execution::{ExecutionConfig, ExecutionMode, ExecutionService};
pub use indicator::{IndicatorConfig, IndicatorService};
pub use position_monitor::{
    JsonTpStore, NullTpStore, PositionMonitorConfig, PositionMonitorService, TpTargetStore,
};
pub use strategy_eval::{StrategyEvalConfig, StrategyEvalService};
