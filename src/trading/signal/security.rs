use tracing::debug;

use super::mailbox::MailEnvelope;

/// 信号邮件的安全闸门。两条放行路径:
/// 1. 发件人在白名单里,且正文含业务关键词
/// 2. 正文带共享口令,且含业务关键词(白名单外的备用通道)
/// 两条都不满足的邮件静默丢弃,但仍会被标记为已处理,不反复扫描。
#[derive(Debug, Clone)]
pub struct SecurityGate {
    allowed_senders: Vec<String>,
    required_keywords: Vec<String>,
    shared_token: Option<String>,
}

impl SecurityGate {
    pub fn new(
        allowed_senders: Vec<String>,
        required_keywords: Vec<String>,
        shared_token: Option<String>,
    ) -> Self {
        Self {
            allowed_senders: allowed_senders
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            required_keywords: required_keywords
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            shared_token: shared_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    /// 从环境变量装配:
    /// SIGNAL_ALLOWED_SENDERS(逗号分隔)/ SIGNAL_KEYWORDS(逗号分隔,
    /// 缺省用内置中文交易关键词)/ SIGNAL_SHARED_TOKEN(可选)
    pub fn from_env() -> Self {
        let senders = std::env::var("SIGNAL_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.to_string())
            .collect();
        let keywords = match std::env::var("SIGNAL_KEYWORDS") {
            Ok(raw) if !raw.trim().is_empty() => raw.split(',').map(|s| s.to_string()).collect(),
            _ => vec![
                "做多".to_string(),
                "做空".to_string(),
                "入场".to_string(),
                "加仓".to_string(),
            ],
        };
        let token = std::env::var("SIGNAL_SHARED_TOKEN").ok();
        Self::new(senders, keywords, token)
    }

    /// 信封粗筛,在拉正文前把明显无关的邮件挡掉。
    /// 这里只看头部:发件人在白名单,或主题/发件人命中任一关键词。
    /// 粗筛通过不代表放行,最终还要过 authorize。
    pub fn envelope_allows(&self, envelope: &MailEnvelope) -> bool {
        if self.sender_allowed(&envelope.from_addr) {
            return true;
        }
        self.contains_any_keyword(&envelope.subject)
            || self.contains_any_keyword(&envelope.from_addr)
    }

    /// 终审:拿到正文后做完整鉴权
    pub fn authorize(&self, envelope: &MailEnvelope, body: &str) -> bool {
        let text = format!("{}\n{}", envelope.subject, body);
        if !self.contains_any_keyword(&text) {
            debug!("信号邮件 {} 未命中业务关键词,丢弃", envelope.uid);
            return false;
        }
        if self.sender_allowed(&envelope.from_addr) {
            return true;
        }
        if let Some(token) = &self.shared_token {
            if body.contains(token.as_str()) {
                return true;
            }
        }
        debug!(
            "信号邮件 {} 发件人 {} 不在白名单且无口令,丢弃",
            envelope.uid, envelope.from_addr
        );
        false
    }

    fn sender_allowed(&self, from_addr: &str) -> bool {
        let addr = from_addr.trim().to_lowercase();
        self.allowed_senders.iter().any(|s| s == &addr)
    }

    fn contains_any_keyword(&self, text: &str) -> bool {
        self.required_keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: &str, subject: &str) -> MailEnvelope {
        MailEnvelope {
            uid: 1,
            subject: subject.to_string(),
            from_addr: from.to_string(),
            received_ms: 0,
        }
    }

    fn gate() -> SecurityGate {
        SecurityGate::new(
            vec!["trader@signal.com".to_string()],
            vec!["做多".to_string(), "做空".to_string()],
            Some("token-88".to_string()),
        )
    }

    #[test]
    fn test_allowlisted_sender_with_keyword_passes() {
        let g = gate();
        let e = envelope("trader@signal.com", "BTC 行情");
        assert!(g.authorize(&e, "做多 BTCUSDT 入场 60000"));
    }

    #[test]
    fn test_allowlisted_sender_without_keyword_rejected() {
        let g = gate();
        let e = envelope("trader@signal.com", "周报");
        assert!(!g.authorize(&e, "本周收益统计"));
    }

    #[test]
    fn test_unknown_sender_with_token_passes() {
        let g = gate();
        let e = envelope("other@else.com", "信号");
        assert!(g.authorize(&e, "口令 token-88 做空 ETHUSDT"));
    }

    #[test]
    fn test_unknown_sender_without_token_rejected() {
        let g = gate();
        let e = envelope("other@else.com", "信号");
        assert!(!g.authorize(&e, "做空 ETHUSDT"));
    }

    #[test]
    fn test_sender_match_is_case_insensitive() {
        let g = gate();
        let e = envelope("Trader@Signal.COM", "x");
        assert!(g.authorize(&e, "做多 BTCUSDT"));
    }

    #[test]
    fn test_envelope_filter_passes_allowlisted_or_keyword_subject() {
        let g = gate();
        assert!(g.envelope_allows(&envelope("trader@signal.com", "随便")));
        assert!(g.envelope_allows(&envelope("other@else.com", "做多 BTC")));
        assert!(!g.envelope_allows(&envelope("other@else.com", "广告")));
    }
}
