use std::env;

use lettre::message::header;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::warn;

/// 发送告警邮件，失败只记录不影响主流程
pub async fn send_email(title: &str, body: String) {
    let smtp_server = env::var("EMAIL_SMTP_SERVER").unwrap_or_else(|_| "smtp.gmail.com".to_string());
    let smtp_port: u16 = env::var("EMAIL_SMTP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(587);

    let from = match env::var("EMAIL_FROM") {
        Ok(v) => v,
        Err(_) => {
            warn!("EMAIL_FROM 未配置，跳过告警邮件");
            return;
        }
    };
    let to = match env::var("EMAIL_TO") {
        Ok(v) => v,
        Err(_) => {
            warn!("EMAIL_TO 未配置，跳过告警邮件");
            return;
        }
    };
    let username = env::var("EMAIL_SEND_USERNAME").unwrap_or_else(|_| from.clone());
    let password = match env::var("EMAIL_SEND_PASSWORD") {
        Ok(v) => v,
        Err(_) => {
            warn!("EMAIL_SEND_PASSWORD 未配置，跳过告警邮件");
            return;
        }
    };

    let (from, to) = match (from.parse(), to.parse()) {
        (Ok(f), Ok(t)) => (f, t),
        _ => {
            warn!("告警邮件地址解析失败");
            return;
        }
    };

    let email = match Message::builder()
        .from(from)
        .to(to)
        .subject(title)
        .header(header::ContentType::TEXT_PLAIN)
        .body(body)
    {
        Ok(m) => m,
        Err(e) => {
            warn!("构建告警邮件失败: {:?}", e);
            return;
        }
    };

    let creds = Credentials::new(username, password);
    let mailer = match SmtpTransport::starttls_relay(&smtp_server) {
        Ok(b) => b.port(smtp_port).credentials(creds).build(),
        Err(e) => {
            warn!("构建SMTP客户端失败: {:?}", e);
            return;
        }
    };

    // SmtpTransport是阻塞客户端，放到阻塞线程执行
    let send_result = tokio::task::spawn_blocking(move || mailer.send(&email)).await;
    match send_result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("告警邮件发送失败: {:?}", e),
        Err(e) => warn!("告警邮件任务异常: {:?}", e),
    }
}
