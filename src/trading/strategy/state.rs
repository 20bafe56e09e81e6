use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// 单个策略(一条信号对应一个策略)的生命周期状态机。
/// 只允许朝前走:等待 -> 入场 -> 一次加仓 -> 二次加仓 -> 关闭,
/// 手动平仓可以从任意状态直接跳到关闭;关闭是终态,再也不动。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Waiting,
    Entry,
    Add1,
    Add2,
    Closed,
}

impl StrategyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyState::Waiting => "WAITING",
            StrategyState::Entry => "ENTRY",
            StrategyState::Add1 => "ADD_1",
            StrategyState::Add2 => "ADD_2",
            StrategyState::Closed => "CLOSED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            StrategyState::Waiting => 0,
            StrategyState::Entry => 1,
            StrategyState::Add1 => 2,
            StrategyState::Add2 => 3,
            StrategyState::Closed => 4,
        }
    }

    /// 当前状态下是否持有仓位
    pub fn position_open(&self) -> bool {
        matches!(
            self,
            StrategyState::Entry | StrategyState::Add1 | StrategyState::Add2
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyState::Closed)
    }

    /// 还有加仓额度时给出下一个加仓档位
    pub fn next_add(&self) -> Option<StrategyState> {
        match self {
            StrategyState::Entry => Some(StrategyState::Add1),
            StrategyState::Add1 => Some(StrategyState::Add2),
            _ => None,
        }
    }

    /// 迁移合法性:终态不出;到 Closed 任意状态都行;其余只能走紧邻的下一档
    pub fn can_transition(&self, to: StrategyState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == StrategyState::Closed {
            return true;
        }
        to.rank() == self.rank() + 1
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "WAITING" => Ok(StrategyState::Waiting),
            "ENTRY" => Ok(StrategyState::Entry),
            "ADD_1" => Ok(StrategyState::Add1),
            "ADD_2" => Ok(StrategyState::Add2),
            "CLOSED" => Ok(StrategyState::Closed),
            other => Err(AppError::Parse(format!("未知策略状态: {}", other))),
        }
    }
}
