use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use native_tls::TlsStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::time_util;

type ImapSession = imap::Session<TlsStream<TcpStream>>;

/// 信号邮箱里一封邮件的信封摘要,粗筛阶段只拉这些字段,不拉正文
#[derive(Debug, Clone)]
pub struct MailEnvelope {
    pub uid: u32,
    pub subject: String,
    /// 发件人地址,已转成小写的 mailbox@host 形式
    pub from_addr: String,
    /// 服务端落信时间(INTERNALDATE),毫秒
    pub received_ms: i64,
}

/// 邮箱读取抽象:IMAP 真实实现 + 内存实现(测试用)
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// 拉取指定时间之后的信封列表(只含头部信息)
    async fn fetch_envelopes(&self, since_ms: i64) -> Result<Vec<MailEnvelope>, AppError>;
    /// 拉取单封邮件的纯文本正文
    async fn fetch_body(&self, uid: u32) -> Result<String, AppError>;
    /// 标记邮件已处理(置 \Seen),后续轮询不再重复消费
    async fn mark_processed(&self, uid: u32) -> Result<(), AppError>;
}

/// 基于 IMAP 的邮箱实现。imap 库是阻塞式的,所有会话操作都丢进
/// spawn_blocking 执行;会话出错时直接丢弃,下次操作自动重连。
pub struct ImapMailbox {
    host: String,
    port: u16,
    username: String,
    password: String,
    session: Mutex<Option<ImapSession>>,
}

impl ImapMailbox {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            session: Mutex::new(None),
        }
    }

    /// 从环境变量装配:IMAP_HOST / IMAP_PORT / IMAP_USERNAME / IMAP_PASSWORD
    pub fn from_env() -> Result<Self, AppError> {
        let host = std::env::var("IMAP_HOST")
            .map_err(|_| AppError::Mail("缺少环境变量 IMAP_HOST".to_string()))?;
        let port = std::env::var("IMAP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(993);
        let username = std::env::var("IMAP_USERNAME")
            .map_err(|_| AppError::Mail("缺少环境变量 IMAP_USERNAME".to_string()))?;
        let password = std::env::var("IMAP_PASSWORD")
            .map_err(|_| AppError::Mail("缺少环境变量 IMAP_PASSWORD".to_string()))?;
        Ok(Self::new(&host, port, &username, &password))
    }

    fn connect_blocking(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<ImapSession, AppError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| AppError::Mail(format!("TLS 初始化失败: {}", e)))?;
        let client = imap::connect((host, port), host, &tls)
            .map_err(|e| AppError::Mail(format!("IMAP 连接失败 {}:{}: {}", host, port, e)))?;
        let mut session = client
            .login(username, password)
            .map_err(|e| AppError::Mail(format!("IMAP 登录失败: {}", e.0)))?;
        session
            .select("INBOX")
            .map_err(|e| AppError::Mail(format!("选择 INBOX 失败: {}", e)))?;
        debug!("IMAP 会话就绪: {}@{}", username, host);
        Ok(session)
    }

    /// 取出(或新建)会话,在阻塞线程里执行操作后放回。
    /// 操作失败时不放回会话,强制下一次走重连路径。
    async fn with_session<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, imap::error::Error> + Send + 'static,
    {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(s) => s,
            None => {
                let host = self.host.clone();
                let port = self.port;
                let username = self.username.clone();
                let password = self.password.clone();
                tokio::task::spawn_blocking(move || {
                    Self::connect_blocking(&host, port, &username, &password)
                })
                .await
                .map_err(|e| AppError::Mail(format!("IMAP 任务中断: {}", e)))??
            }
        };

        let (session, result) = tokio::task::spawn_blocking(move || {
            let r = op(&mut session);
            (session, r)
        })
        .await
        .map_err(|e| AppError::Mail(format!("IMAP 任务中断: {}", e)))?;

        match result {
            Ok(v) => {
                *guard = Some(session);
                Ok(v)
            }
            Err(e) => {
                // 会话状态存疑,丢弃掉,下次操作重新登录
                drop(session);
                warn!("IMAP 操作失败,丢弃会话待重连: {}", e);
                Err(AppError::Mail(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl MailTransport for ImapMailbox {
    async fn fetch_envelopes(&self, since_ms: i64) -> Result<Vec<MailEnvelope>, AppError> {
        // IMAP SINCE 只有天级精度,毫秒级过滤由调用方按 received_ms 再做一遍
        let since_date = time_util::imap_since_date(since_ms);
        self.with_session(move |session| {
            let uids = session.uid_search(format!("SINCE {}", since_date))?;
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            let mut sorted: Vec<u32> = uids.into_iter().collect();
            sorted.sort_unstable();
            let uid_set = sorted
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session.uid_fetch(uid_set, "(ENVELOPE INTERNALDATE)")?;
            let mut envelopes = Vec::with_capacity(fetches.len());
            for fetch in fetches.iter() {
                let uid = match fetch.uid {
                    Some(uid) => uid,
                    None => continue,
                };
                let received_ms = match fetch.internal_date() {
                    Some(dt) => dt.timestamp_millis(),
                    None => continue,
                };
                let envelope = match fetch.envelope() {
                    Some(e) => e,
                    None => continue,
                };
                let subject = envelope
                    .subject
                    .as_ref()
                    .map(|raw| decode_header_value(raw))
                    .unwrap_or_default();
                let from_addr = envelope
                    .from
                    .as_ref()
                    .and_then(|addrs| addrs.first())
                    .and_then(|addr| {
                        let mailbox = addr.mailbox.as_ref()?;
                        let host = addr.host.as_ref()?;
                        Some(format!(
                            "{}@{}",
                            String::from_utf8_lossy(mailbox),
                            String::from_utf8_lossy(host)
                        ))
                    })
                    .unwrap_or_default()
                    .to_lowercase();
                envelopes.push(MailEnvelope {
                    uid,
                    subject,
                    from_addr,
                    received_ms,
                });
            }
            Ok(envelopes)
        })
        .await
    }

    async fn fetch_body(&self, uid: u32) -> Result<String, AppError> {
        let body = self
            .with_session(move |session| {
                // BODY.PEEK 不动 \Seen 标记,已处理标记由 mark_processed 统一落
                let fetches = session.uid_fetch(uid.to_string(), "BODY.PEEK[]")?;
                let raw = fetches
                    .iter()
                    .next()
                    .and_then(|f| f.body())
                    .map(|b| b.to_vec());
                Ok(raw)
            })
            .await?;
        let raw = body.ok_or_else(|| AppError::Mail(format!("邮件 {} 无正文", uid)))?;
        extract_text_body(&raw)
    }

    async fn mark_processed(&self, uid: u32) -> Result<(), AppError> {
        self.with_session(move |session| {
            session.uid_store(uid.to_string(), "+FLAGS (\\Seen)")?;
            Ok(())
        })
        .await
    }
}

/// 解 RFC2047 编码的头部(=?UTF-8?B?...?= 之类),失败退化为按 UTF-8 硬转
fn decode_header_value(raw: &[u8]) -> String {
    let mut line = Vec::with_capacity(raw.len() + 10);
    line.extend_from_slice(b"Subject: ");
    line.extend_from_slice(raw);
    line.extend_from_slice(b"\n");
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).trim().to_string(),
    }
}

/// 从原始邮件里抽纯文本正文:深度优先找第一个 text/plain 部件,
/// 都没有就退回顶层正文
fn extract_text_body(raw: &[u8]) -> Result<String, AppError> {
    fn find_plain(part: &mailparse::ParsedMail) -> Option<String> {
        if part.subparts.is_empty() {
            if part.ctype.mimetype.starts_with("text/plain") {
                return part.get_body().ok();
            }
            return None;
        }
        part.subparts.iter().find_map(find_plain)
    }

    let mail = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Mail(format!("邮件体解析失败: {}", e)))?;
    find_plain(&mail)
        .or_else(|| mail.get_body().ok())
        .map(|b| b.trim().to_string())
        .ok_or_else(|| AppError::Mail("邮件无纯文本正文".to_string()))
}

/// 内存邮箱,测试与本地联调用
#[derive(Default)]
pub struct MemoryMailbox {
    mails: StdMutex<Vec<StoredMail>>,
    fail_next_body: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct StoredMail {
    pub uid: u32,
    pub subject: String,
    pub from_addr: String,
    pub received_ms: i64,
    pub body: String,
    pub processed: bool,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_mail(&self, uid: u32, subject: &str, from_addr: &str, received_ms: i64, body: &str) {
        let mut mails = self.mails.lock().unwrap_or_else(|e| e.into_inner());
        mails.push(StoredMail {
            uid,
            subject: subject.to_string(),
            from_addr: from_addr.to_lowercase(),
            received_ms,
            body: body.to_string(),
            processed: false,
        });
    }

    /// 下一次 fetch_body 返回一次网络错误,模拟瞬时故障
    pub fn fail_next_body(&self) {
        self.fail_next_body.store(true, Ordering::SeqCst);
    }

    pub fn processed_uids(&self) -> Vec<u32> {
        let mails = self.mails.lock().unwrap_or_else(|e| e.into_inner());
        mails
            .iter()
            .filter(|m| m.processed)
            .map(|m| m.uid)
            .collect()
    }
}

#[async_trait]
impl MailTransport for MemoryMailbox {
    async fn fetch_envelopes(&self, since_ms: i64) -> Result<Vec<MailEnvelope>, AppError> {
        let mails = self.mails.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mails
            .iter()
            .filter(|m| m.received_ms >= since_ms)
            .map(|m| MailEnvelope {
                uid: m.uid,
                subject: m.subject.clone(),
                from_addr: m.from_addr.clone(),
                received_ms: m.received_ms,
            })
            .collect())
    }

    async fn fetch_body(&self, uid: u32) -> Result<String, AppError> {
        if self.fail_next_body.swap(false, Ordering::SeqCst) {
            return Err(AppError::Transport("模拟的正文拉取故障".to_string()));
        }
        let mails = self.mails.lock().unwrap_or_else(|e| e.into_inner());
        mails
            .iter()
            .find(|m| m.uid == uid)
            .map(|m| m.body.clone())
            .ok_or_else(|| AppError::Mail(format!("邮件 {} 不存在", uid)))
    }

    async fn mark_processed(&self, uid: u32) -> Result<(), AppError> {
        let mut mails = self.mails.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mail) = mails.iter_mut().find(|m| m.uid == uid) {
            mail.processed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_header() {
        assert_eq!(decode_header_value(b"BTC signal"), "BTC signal");
    }

    #[test]
    fn test_decode_rfc2047_header() {
        // "做多 BTC" 的 UTF-8 Base64 编码
        let raw = b"=?UTF-8?B?5YGa5aSaIEJUQw==?=";
        assert_eq!(decode_header_value(raw), "做多 BTC");
    }

    #[test]
    fn test_extract_plain_body() {
        let raw = b"From: a@b.com\r\nSubject: hi\r\nContent-Type: text/plain\r\n\r\nbody line\r\n";
        assert_eq!(extract_text_body(raw).unwrap(), "body line");
    }

    #[test]
    fn test_extract_multipart_prefers_plain() {
        let raw = b"From: a@b.com\r\nContent-Type: multipart/alternative; boundary=\"xyz\"\r\n\r\n\
--xyz\r\nContent-Type: text/html\r\n\r\n<b>html</b>\r\n\
--xyz\r\nContent-Type: text/plain\r\n\r\nplain text\r\n\
--xyz--\r\n";
        assert_eq!(extract_text_body(raw).unwrap(), "plain text");
    }

    #[tokio::test]
    async fn test_memory_mailbox_since_filter() {
        let mailbox = MemoryMailbox::new();
        mailbox.push_mail(1, "old", "a@b.com", 1_000, "old body");
        mailbox.push_mail(2, "new", "a@b.com", 5_000, "new body");
        let envelopes = mailbox.fetch_envelopes(2_000).await.unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].uid, 2);
    }

    #[tokio::test]
    async fn test_memory_mailbox_mark_processed() {
        let mailbox = MemoryMailbox::new();
        mailbox.push_mail(7, "s", "a@b.com", 1, "b");
        mailbox.mark_processed(7).await.unwrap();
        assert_eq!(mailbox.processed_uids(), vec![7]);
    }
}
