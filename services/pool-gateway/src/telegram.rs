//! Telegram delivery of member health transitions

use std::time::Duration;

use pool_store::MonitorConfig;
use session::BoxFuture;
use session_pool::{Notifier, Transition};
use tracing::{debug, info, warn};

pub const TELEGRAM_API: &str = "https://api.telegram.org";

/// Per-message send timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends transition notices through the Telegram bot API, and always logs them.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_api_base(client, TELEGRAM_API)
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    async fn send(&self, token: &str, chat_id: &str, text: &str) -> Result<(), String> {
        let url = format!(
            "{}/bot{token}/sendMessage",
            self.api_base.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .timeout(SEND_TIMEOUT)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("telegram responded with {status}"));
        }
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn notify<'a>(
        &'a self,
        monitor: &'a MonitorConfig,
        member_id: &'a str,
        transition: Transition,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(member_id, transition = transition.as_str(), "member health changed");

            if !monitor.telegram_configured() {
                debug!("telegram not configured, skipping notification");
                return;
            }
            let (Some(token), Some(chat_id)) = (&monitor.tg_bot_token, &monitor.tg_chat_id) else {
                return;
            };

            // Never log the bot token; it is part of the URL
            match self.send(token, chat_id, &transition.message(member_id)).await {
                Ok(()) => debug!(member_id, "telegram notification sent"),
                Err(e) => warn!(member_id, error = %e, "telegram notification failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    /// Stand-in bot API that records every sendMessage call.
    async fn start_bot_api(status: StatusCode) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen: Seen = Arc::default();

        let app = axum::Router::new()
            .route(
                "/{bot}/sendMessage",
                axum::routing::post(
                    move |State(seen): State<Seen>,
                          Path(bot): Path<String>,
                          axum::Json(body): axum::Json<serde_json::Value>| async move {
                        seen.lock().unwrap().push((bot, body));
                        status
                    },
                ),
            )
            .with_state(seen.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, seen)
    }

    fn configured() -> MonitorConfig {
        MonitorConfig {
            tg_bot_token: Some("123:abc".into()),
            tg_chat_id: Some("42".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sends_html_message_to_chat() {
        let (url, seen) = start_bot_api(StatusCode::OK).await;
        let notifier = TelegramNotifier::with_api_base(reqwest::Client::new(), url);

        notifier
            .notify(&configured(), "acct-1", Transition::Offline)
            .await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "bot123:abc");
        assert_eq!(seen[0].1["chat_id"], "42");
        assert_eq!(seen[0].1["parse_mode"], "HTML");
        assert!(
            seen[0].1["text"]
                .as_str()
                .unwrap()
                .contains("<code>acct-1</code>")
        );
    }

    #[tokio::test]
    async fn unconfigured_monitor_sends_nothing() {
        let (url, seen) = start_bot_api(StatusCode::OK).await;
        let notifier = TelegramNotifier::with_api_base(reqwest::Client::new(), url);

        let mut monitor = configured();
        monitor.tg_chat_id = Some(String::new());
        notifier.notify(&monitor, "acct-1", Transition::Recovered).await;
        notifier
            .notify(&MonitorConfig::default(), "acct-1", Transition::Recovered)
            .await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let (url, seen) = start_bot_api(StatusCode::BAD_REQUEST).await;
        let notifier = TelegramNotifier::with_api_base(reqwest::Client::new(), url);

        notifier
            .notify(&configured(), "acct-1", Transition::Exhausted)
            .await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_errors_omit_the_bot_token() {
        // Nothing listens on port 1
        let notifier =
            TelegramNotifier::with_api_base(reqwest::Client::new(), "http://127.0.0.1:1");

        let err = notifier
            .send("123456:SECRET-BOT-TOKEN", "42", "hello")
            .await
            .unwrap_err();
        assert!(!err.contains("SECRET-BOT-TOKEN"), "token leaked: {err}");
        assert!(!err.contains("/bot"), "url leaked: {err}");
    }
}
