//! Generic webhook notification channel.

use super::{Notification, Notifier, NotifyError};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMethod {
    Get,
    #[default]
    Post,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Json,
    Form,
}

fn default_tag() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

/// One webhook channel as described in the notifiers file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookChannel {
    pub name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub url: String,
    #[serde(default)]
    pub method: RequestMethod,
    #[serde(default)]
    pub body_type: BodyType,
    /// Body template. For form bodies this is a JSON object of field templates.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// Sends notifications to an HTTP endpoint.
pub struct WebhookNotifier {
    channel: WebhookChannel,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(channel: WebhookChannel) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .danger_accept_invalid_certs(!channel.verify_tls)
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        Ok(Self { channel, client })
    }

    pub fn channel(&self) -> &WebhookChannel {
        &self.channel
    }

    fn form_fields(&self, notification: &Notification) -> Result<Vec<(String, String)>, NotifyError> {
        if self.channel.body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let fields: BTreeMap<String, String> = serde_json::from_str(&self.channel.body)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(fields
            .into_iter()
            .map(|(k, v)| (k, render(&v, notification, Escape::None)))
            .collect())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.channel.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let url = render(&self.channel.url, notification, Escape::Url);

        let mut request = match self.channel.method {
            RequestMethod::Get => self.client.get(&url),
            RequestMethod::Post => {
                let req = self.client.post(&url);
                match self.channel.body_type {
                    BodyType::Json => {
                        let body = render(&self.channel.body, notification, Escape::Json);
                        req.header("Content-Type", "application/json").body(body)
                    }
                    BodyType::Form => req.form(&self.form_fields(notification)?),
                }
            }
        };

        for (k, v) in &self.channel.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(NotifyError::Status(status.as_u16(), snippet));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Escape {
    None,
    Url,
    Json,
}

fn escape(value: &str, mode: Escape) -> String {
    match mode {
        Escape::None => value.to_string(),
        Escape::Url => urlencoding::encode(value).into_owned(),
        Escape::Json => {
            let quoted = serde_json::Value::String(value.to_string()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        }
    }
}

/// Substitute `#MESSAGE#`, `#SERVER.NAME#`, `#SERVER.IP#` and `#SERVER.ID#`.
fn render(template: &str, notification: &Notification, mode: Escape) -> String {
    let (name, ip, id) = match &notification.server {
        Some(s) => (s.name.as_str(), s.ip.as_str(), s.id.to_string()),
        None => ("", "", String::new()),
    };

    template
        .replace("#MESSAGE#", &escape(&notification.message, mode))
        .replace("#SERVER.NAME#", &escape(name, mode))
        .replace("#SERVER.IP#", &escape(ip, mode))
        .replace("#SERVER.ID#", &id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ServerContext;

    fn notification() -> Notification {
        Notification::new("CPU \"high\" on edge & co").with_server(ServerContext {
            id: 7,
            name: "edge 1".to_string(),
            ip: "10.****.4".to_string(),
        })
    }

    fn channel(json: &str) -> WebhookChannel {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_render_url_escapes() {
        let out = render(
            "https://hook.local/send?text=#MESSAGE#&s=#SERVER.NAME#",
            &notification(),
            Escape::Url,
        );
        assert_eq!(
            out,
            "https://hook.local/send?text=CPU%20%22high%22%20on%20edge%20%26%20co&s=edge%201"
        );
    }

    #[test]
    fn test_render_json_escapes() {
        let out = render(
            r##"{"text":"#MESSAGE#","server":"#SERVER.NAME#","id":#SERVER.ID#}"##,
            &notification(),
            Escape::Json,
        );
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["text"], "CPU \"high\" on edge & co");
        assert_eq!(v["server"], "edge 1");
        assert_eq!(v["id"], 7);
    }

    #[test]
    fn test_render_without_server() {
        let out = render("#MESSAGE#|#SERVER.IP#", &Notification::new("hi"), Escape::None);
        assert_eq!(out, "hi|");
    }

    #[test]
    fn test_channel_defaults() {
        let c = channel(r#"{"name":"ops hook","url":"https://hook.local"}"#);
        assert_eq!(c.tag, "default");
        assert_eq!(c.method, RequestMethod::Post);
        assert_eq!(c.body_type, BodyType::Json);
        assert!(c.verify_tls);
    }

    #[test]
    fn test_form_fields() {
        let c = channel(
            r##"{"name":"f","url":"https://hook.local","body_type":"form","body":"{\"msg\":\"#MESSAGE#\",\"ip\":\"#SERVER.IP#\"}"}"##,
        );
        let n = WebhookNotifier::new(c).unwrap();
        let fields = n.form_fields(&notification()).unwrap();
        assert_eq!(
            fields,
            vec![
                ("ip".to_string(), "10.****.4".to_string()),
                ("msg".to_string(), "CPU \"high\" on edge & co".to_string()),
            ]
        );
    }

    #[test]
    fn test_form_fields_bad_template() {
        let c = channel(r#"{"name":"f","url":"https://hook.local","body_type":"form","body":"not json"}"#);
        let n = WebhookNotifier::new(c).unwrap();
        assert!(matches!(
            n.form_fields(&notification()),
            Err(NotifyError::Template(_))
        ));
    }

    #[tokio::test]
    async fn test_send_unreachable() {
        let c = channel(r#"{"name":"dead","url":"http://256.256.256.256/hook","method":"get"}"#);
        let n = WebhookNotifier::new(c).unwrap();
        assert!(n.send(&notification()).await.is_err());
    }
}
