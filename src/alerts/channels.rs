use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::types::{Alert, AlertSeverity, ChannelType};
use crate::config::{ChannelsConfig, EmailConfig};
use crate::error::{MonitorError, Result};

const DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delivery seam between the alert system and the outside world.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Delivery target for `channel`, or `None` when the channel is not configured.
    fn target(&self, channel: ChannelType) -> Option<String>;

    async fn dispatch(&self, alert: &Alert, channel: ChannelType) -> Result<()>;
}

/// Renders and sends alerts over SMTP and HTTP webhooks.
pub struct ChannelDispatcher {
    client: Client,
    config: ChannelsConfig,
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
    retry_delay: Duration,
}

impl ChannelDispatcher {
    pub fn new(config: ChannelsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| MonitorError::delivery("http", e))?;

        let mailer = config.email.as_ref().map(build_mailer).transpose()?;

        Ok(Self {
            client,
            config,
            mailer,
            retry_delay: RETRY_DELAY,
        })
    }

    async fn with_retries<F, Fut>(&self, channel: ChannelType, mut attempt_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match attempt_fn().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        attempt,
                        max_attempts = DELIVERY_ATTEMPTS,
                        error = %e,
                        "Alert delivery attempt failed"
                    );
                    last_error = e;
                }
            }
            if attempt < DELIVERY_ATTEMPTS {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }
        Err(MonitorError::delivery(channel, last_error))
    }

    async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<(), String> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }

    async fn send_email(&self, alert: &Alert) -> Result<()> {
        let (Some(config), Some(mailer)) = (&self.config.email, &self.mailer) else {
            return Err(MonitorError::delivery(ChannelType::Email, "email channel not configured"));
        };
        let message = &build_email(config, alert)?;
        self.with_retries(ChannelType::Email, || async move {
            mailer
                .send(message.clone())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
    }
}

#[async_trait]
impl Dispatch for ChannelDispatcher {
    fn target(&self, channel: ChannelType) -> Option<String> {
        match channel {
            ChannelType::LiveFeed => Some("live_feed".to_string()),
            ChannelType::Email => self.config.email.as_ref().map(|e| e.to.join(",")),
            ChannelType::Slack => self.config.slack.as_ref().map(|s| redact_url(&s.webhook_url)),
            ChannelType::Discord => self.config.discord.as_ref().map(|d| redact_url(&d.webhook_url)),
            ChannelType::Webhook => self.config.webhook.as_ref().map(|w| redact_url(&w.url)),
        }
    }

    async fn dispatch(&self, alert: &Alert, channel: ChannelType) -> Result<()> {
        let no_headers = HashMap::new();
        match channel {
            ChannelType::LiveFeed => Ok(()),
            ChannelType::Email => self.send_email(alert).await,
            ChannelType::Slack => {
                let slack = self.config.slack.as_ref().ok_or_else(|| {
                    MonitorError::delivery(channel, "slack channel not configured")
                })?;
                let body = slack_payload(alert, slack.username.as_deref());
                self.with_retries(channel, || self.post_json(&slack.webhook_url, &body, &no_headers))
                    .await
            }
            ChannelType::Discord => {
                let discord = self.config.discord.as_ref().ok_or_else(|| {
                    MonitorError::delivery(channel, "discord channel not configured")
                })?;
                let body = discord_payload(alert, discord.username.as_deref());
                self.with_retries(channel, || {
                    self.post_json(&discord.webhook_url, &body, &no_headers)
                })
                .await
            }
            ChannelType::Webhook => {
                let webhook = self.config.webhook.as_ref().ok_or_else(|| {
                    MonitorError::delivery(channel, "webhook channel not configured")
                })?;
                let body = serde_json::to_value(alert)?;
                self.with_retries(channel, || self.post_json(&webhook.url, &body, &webhook.headers))
                    .await
            }
        }
    }
}

fn build_mailer(config: &EmailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        .map_err(|e| MonitorError::delivery(ChannelType::Email, e))?
        .port(config.smtp_port);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

fn build_email(config: &EmailConfig, alert: &Alert) -> Result<Message> {
    let parse = |addr: &str| {
        addr.parse::<Mailbox>()
            .map_err(|e| MonitorError::delivery(ChannelType::Email, format!("{}: {}", addr, e)))
    };

    let mut builder = Message::builder()
        .from(parse(&config.from)?)
        .subject(format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.title));
    for to in &config.to {
        builder = builder.to(parse(to)?);
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            email_text(alert),
            email_html(alert),
        ))
        .map_err(|e| MonitorError::delivery(ChannelType::Email, e))
}

/// Keep only scheme and host so webhook secrets never reach the store or logs.
fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or_default();
            format!("{}://{}", scheme, host)
        }
        None => "webhook".to_string(),
    }
}

fn severity_color(severity: AlertSeverity) -> u32 {
    match severity {
        AlertSeverity::Critical => 0xD32F2F,
        AlertSeverity::High | AlertSeverity::Error => 0xF57C00,
        AlertSeverity::Warning | AlertSeverity::Medium => 0xFBC02D,
        AlertSeverity::Info | AlertSeverity::Low => 0x1976D2,
    }
}

fn context_fields(alert: &Alert) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("Severity", alert.severity.as_str().to_string()),
        ("Type", alert.alert_type.as_str().to_string()),
    ];
    if let Some(network) = &alert.network {
        fields.push(("Network", network.clone()));
    }
    if let Some(contract) = &alert.contract_address {
        fields.push(("Contract", contract.clone()));
    }
    if let Some(tx) = &alert.transaction_ref {
        fields.push(("Transaction", tx.clone()));
    }
    fields
}

pub fn slack_payload(alert: &Alert, username: Option<&str>) -> JsonValue {
    let fields: Vec<JsonValue> = context_fields(alert)
        .into_iter()
        .map(|(title, value)| json!({ "title": title, "value": value, "short": true }))
        .collect();

    json!({
        "username": username.unwrap_or("Bridge Monitor"),
        "attachments": [{
            "color": format!("#{:06X}", severity_color(alert.severity)),
            "title": alert.title,
            "text": alert.message,
            "fields": fields,
            "footer": format!("alert {}", alert.alert_id),
            "ts": alert.created_at.timestamp(),
        }],
    })
}

pub fn discord_payload(alert: &Alert, username: Option<&str>) -> JsonValue {
    let fields: Vec<JsonValue> = context_fields(alert)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value, "inline": true }))
        .collect();

    json!({
        "username": username.unwrap_or("Bridge Monitor"),
        "embeds": [{
            "title": alert.title,
            "description": alert.message,
            "color": severity_color(alert.severity),
            "fields": fields,
            "footer": { "text": format!("alert {}", alert.alert_id) },
            "timestamp": alert.created_at.to_rfc3339(),
        }],
    })
}

fn email_text(alert: &Alert) -> String {
    let mut body = format!("{}\n\n{}\n\n", alert.title, alert.message);
    for (name, value) in context_fields(alert) {
        body.push_str(&format!("{}: {}\n", name, value));
    }
    body.push_str(&format!("Alert id: {}\nCreated: {}\n", alert.alert_id, alert.created_at));
    body
}

fn email_html(alert: &Alert) -> String {
    let rows: String = context_fields(alert)
        .into_iter()
        .map(|(name, value)| {
            format!(
                "<tr><td><b>{}</b></td><td>{}</td></tr>",
                name,
                escape_html(&value)
            )
        })
        .collect();

    format!(
        "<html><body>\
         <h2 style=\"color:#{:06X}\">{}</h2>\
         <p>{}</p>\
         <table>{}</table>\
         <p style=\"color:#888\">Alert {} created {}</p>\
         </body></html>",
        severity_color(alert.severity),
        escape_html(&alert.title),
        escape_html(&alert.message),
        rows,
        escape_html(&alert.alert_id),
        alert.created_at.to_rfc3339(),
    )
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
