// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTML email

use crate::credentials::CredentialProvider;
use crate::template::{Template, TemplateVars};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use diagnostics::*;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const GMAIL_BASE: &str = "https://gmail.googleapis.com";

/// Base64 body lines are wrapped at this width.
const LINE_WIDTH: usize = 76;

/// An HTML message. Each `with_*` step returns a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    sender_name: String,
    to: Vec<String>,
    cc: Vec<String>,
    subject: String,
    html: String,
}

impl Email {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    #[must_use]
    pub fn with_to<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to = recipients.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cc<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cc = recipients.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    /// Body rendered from `template`.
    pub fn with_template(self, template: &Template, vars: &TemplateVars) -> Result<Self> {
        Ok(self.with_html(template.render(vars)?))
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn to(&self) -> &[String] {
        &self.to
    }

    #[must_use]
    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }

    /// RFC 5322 message from `from` (an address), with a base64 HTML body.
    pub fn to_mime(&self, from: &str) -> Result<String> {
        if self.to.is_empty() {
            return Err(Error::Configuration("email has no recipients".to_string()));
        }

        let sender = if self.sender_name.is_empty() {
            from.to_string()
        } else {
            format!("{} <{from}>", encode_word(&self.sender_name))
        };

        let mut headers = vec![("From", sender), ("To", self.to.join(", "))];
        if !self.cc.is_empty() {
            headers.push(("Cc", self.cc.join(", ")));
        }
        headers.push(("Subject", encode_word(&self.subject)));

        let mut message = String::new();
        for (name, value) in &headers {
            if value.contains(['\r', '\n']) {
                return Err(Error::Configuration(format!(
                    "email header {name} contains a line break"
                )));
            }
            message.push_str(&format!("{name}: {value}\r\n"));
        }
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/html; charset=\"utf-8\"\r\n");
        message.push_str("Content-Transfer-Encoding: base64\r\n\r\n");

        let body = STANDARD.encode(self.html.as_bytes());
        for chunk in body.as_bytes().chunks(LINE_WIDTH) {
            // base64 output is ASCII
            message.push_str(&String::from_utf8_lossy(chunk));
            message.push_str("\r\n");
        }
        Ok(message)
    }

    /// The message in URL-safe base64, as the Gmail API expects.
    pub fn raw(&self, from: &str) -> Result<String> {
        Ok(URL_SAFE.encode(self.to_mime(from)?.as_bytes()))
    }

    /// Send through `service`; returns the service's message id.
    pub async fn send(&self, service: &dyn MailService) -> Result<String> {
        let from = service.sender_address().await?;
        let id = service.send_raw(&self.raw(&from)?).await?;
        info!(
            "Sent email {subject} to {count} recipients",
            subject: self.subject.as_str(),
            count: self.to.len() + self.cc.len(),
        );
        Ok(id)
    }
}

/// RFC 2047 encoded word for non-ASCII header text.
fn encode_word(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(text.as_bytes()))
    }
}

#[async_trait]
pub trait MailService: Send + Sync + fmt::Debug {
    /// Address messages are sent from.
    async fn sender_address(&self) -> Result<String>;

    /// Send a URL-safe base64 message; returns its id.
    async fn send_raw(&self, raw: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    base: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

impl GmailClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::with_base_url(credentials, GMAIL_BASE)
    }

    pub fn with_base_url(credentials: Arc<dyn CredentialProvider>, base: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            credentials,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.credentials.service_token().await?;
        let response = request.bearer_auth(&token.access_token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl MailService for GmailClient {
    async fn sender_address(&self) -> Result<String> {
        let url = format!("{}/gmail/v1/users/me/profile", self.base);
        let profile: Profile = self.send(self.http.get(url)).await?.json().await?;
        Ok(profile.email_address)
    }

    async fn send_raw(&self, raw: &str) -> Result<String> {
        let url = format!("{}/gmail/v1/users/me/messages/send", self.base);
        let sent: SentMessage = self
            .send(self.http.post(url).json(&json!({ "raw": raw })))
            .await?
            .json()
            .await?;
        Ok(sent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> Email {
        Email::new()
            .with_sender_name("Reports")
            .with_to(["a@example.com", "b@example.com"])
            .with_cc(["c@example.com"])
            .with_subject("Daily load")
            .with_html("<p>done</p>")
    }

    #[test]
    fn test_headers() {
        let mime = email().to_mime("me@example.com").expect("mime");
        assert!(mime.starts_with("From: Reports <me@example.com>\r\n"));
        assert!(mime.contains("To: a@example.com, b@example.com\r\n"));
        assert!(mime.contains("Cc: c@example.com\r\n"));
        assert!(mime.contains("Subject: Daily load\r\n"));
        assert!(mime.contains("Content-Type: text/html; charset=\"utf-8\"\r\n"));

        let body = mime.split("\r\n\r\n").nth(1).expect("body").trim_end();
        assert_eq!(STANDARD.decode(body).expect("base64"), b"<p>done</p>");
    }

    #[test]
    fn test_builder_returns_new_values() {
        let base = Email::new().with_subject("a");
        let changed = base.clone().with_subject("b");
        assert_eq!(base.subject(), "a");
        assert_eq!(changed.subject(), "b");
    }

    #[test]
    fn test_non_ascii_subject_encoded() {
        let mime = email()
            .with_subject("Résumé")
            .to_mime("me@example.com")
            .expect("mime");
        assert!(mime.contains("Subject: =?utf-8?b?UsOpc3Vtw6k=?=\r\n"));
    }

    #[test]
    fn test_rejects_header_injection_and_no_recipients() {
        let err = email()
            .with_subject("hi\r\nBcc: x@example.com")
            .to_mime("me@example.com")
            .expect_err("injection");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);

        let err = Email::new().with_subject("x").to_mime("me").expect_err("no to");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_body_from_template() {
        let template = Template::new("body", "<b>{{ n }} rows</b>").with_keys(["n"]);
        let mail = Email::new()
            .with_template(&template, &crate::template::vars([("n", 5)]))
            .expect("render");
        assert_eq!(mail.html(), "<b>5 rows</b>");
    }

    #[tokio::test]
    async fn test_send_uses_service_address() {
        let service = crate::testing::MemoryMailService::new("reports@example.com");
        let id = email().send(&service).await.expect("send");
        assert_eq!(id, "msg-1");

        let sent = service.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("From: Reports <reports@example.com>\r\n"));
    }

    #[test]
    fn test_raw_is_url_safe() {
        let raw = email().raw("me@example.com").expect("raw");
        assert!(!raw.contains('+') && !raw.contains('/'));
        let decoded = URL_SAFE.decode(raw).expect("decode");
        assert!(String::from_utf8(decoded).expect("utf8").starts_with("From:"));
    }
}
