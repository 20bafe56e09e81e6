use std::collections::VecDeque;

use crate::CandleItem;

pub const DEFAULT_WINDOW_CAPACITY: usize = 200;

/// 固定容量的K线环形窗口,只收已收盘的K线
///
/// 时间戳单调不减: 比尾部旧的直接丢弃,与尾部相同的原地覆盖(交易所重推同一根),
/// 更新的推入尾部,超容量时从头部淘汰
#[derive(Debug)]
pub struct CandleWindow {
    capacity: usize,
    items: VecDeque<CandleItem>,
}

impl CandleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// 返回是否接受了这根K线
    pub fn push(&mut self, candle: CandleItem) -> bool {
        if let Some(last) = self.items.back_mut() {
            if candle.ts() < last.ts() {
                return false;
            }
            if candle.ts() == last.ts() {
                *last = candle;
                return true;
            }
        }
        self.items.push_back(candle);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn last(&self) -> Option<&CandleItem> {
        self.items.back()
    }

    /// 按时间升序拷贝一份窗口内容,供指标计算,不持有窗口锁
    pub fn snapshot(&self) -> Vec<CandleItem> {
        self.items.iter().cloned().collect()
    }
}
