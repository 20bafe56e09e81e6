use chrono::{DateTime, TimeZone, Utc};

/// 当前Unix时间戳，毫秒
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// OKX签名使用的ISO时间戳，形如 2020-12-08T09:08:57.715Z
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// IMAP SEARCH SINCE 使用的日期格式，形如 08-Dec-2020
pub fn imap_since_date(timestamp_ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imap_since_date() {
        assert_eq!(imap_since_date(1_600_000_000_000), "13-Sep-2020");
    }
}
