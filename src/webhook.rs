//! HTTP POST client that wakes the agent host (C9).

use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::error::WebhookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// `/hooks/agent` — turn triggers.
    Agent,
    /// `/hooks/wake` — auxiliary pings.
    Wake,
}

impl HookKind {
    fn path(self) -> &'static str {
        match self {
            HookKind::Agent => "/hooks/agent",
            HookKind::Wake => "/hooks/wake",
        }
    }
}

#[derive(Debug, Serialize)]
struct WakePayload<'a> {
    message: &'a str,
    metadata: serde_json::Value,
}

/// Result of a `wake()` call, recorded into trigger history.
#[derive(Debug, Clone)]
pub struct WakeResult {
    pub ok: bool,
    pub status: String,
    pub session_key: Option<String>,
}

pub struct WebhookClient {
    agent: ureq::Agent,
    base_url: Option<String>,
    token: Option<String>,
    auth_header: String,
    max_retries: u32,
}

impl WebhookClient {
    pub fn new(base_url: Option<String>, token: Option<String>, auth_header: String, timeout_s: u64, max_retries: u32) -> Self {
        if token.is_none() {
            tracing::warn!("webhook token not configured; calls will record auth=missing");
        }
        let agent = ureq::AgentBuilder::new().timeout(Duration::from_secs(timeout_s)).build();
        Self {
            agent,
            base_url,
            token,
            auth_header,
            max_retries,
        }
    }

    /// POST a wake-up JSON body with retries on transport error or 5xx,
    /// exponential backoff starting at 500ms capped at 5s. 4xx is never
    /// retried (spec.md §4.7).
    pub fn wake(&self, kind: HookKind, message: &str, metadata: serde_json::Value) -> WakeResult {
        let Some(base) = &self.base_url else {
            return WakeResult {
                ok: false,
                status: "no_url_configured".to_string(),
                session_key: None,
            };
        };

        // Compose from scheme+host, not substring replacement on the path
        // (spec.md §4.7).
        let url = format!("{}{}", base.trim_end_matches('/'), kind.path());
        let payload = WakePayload { message, metadata };

        let mut backoff = Duration::from_millis(500);
        let max_backoff = Duration::from_secs(5);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self.agent.post(&url);
            let auth_value = match &self.token {
                Some(t) => format!("Bearer {t}"),
                None => String::new(),
            };
            if !auth_value.is_empty() {
                request = request.set(&self.auth_header, &auth_value);
            }

            match request.send_json(ureq::json!(payload)) {
                Ok(resp) => {
                    let status = resp.status();
                    let session_key = resp.header("X-Session-Key").map(|s| s.to_string());
                    return WakeResult {
                        ok: true,
                        status: status.to_string(),
                        session_key,
                    };
                }
                Err(ureq::Error::Status(code, _)) if (400..500).contains(&code) => {
                    return WakeResult {
                        ok: false,
                        status: format!("4xx:{code}"),
                        session_key: None,
                    };
                }
                Err(ureq::Error::Status(code, _)) => {
                    let err = WebhookError::ServerError { status: code, attempts: attempt };
                    if attempt > self.max_retries {
                        tracing::warn!(error = %err, "webhook server error, giving up");
                        return WakeResult {
                            ok: false,
                            status: format!("5xx:{code}"),
                            session_key: None,
                        };
                    }
                }
                Err(ureq::Error::Transport(t)) => {
                    if attempt > self.max_retries {
                        tracing::warn!(error = %t, "webhook transport error, giving up");
                        return WakeResult {
                            ok: false,
                            status: "transport_error".to_string(),
                            session_key: None,
                        };
                    }
                }
            }

            thread::sleep(backoff);
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    pub fn auth_present(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_url_configured_returns_failed_status() {
        let client = WebhookClient::new(None, None, "Authorization".to_string(), 1, 0);
        let result = client.wake(HookKind::Agent, "hi", serde_json::json!({}));
        assert!(!result.ok);
        assert_eq!(result.status, "no_url_configured");
    }

    #[test]
    fn hook_kind_paths_are_distinct() {
        assert_eq!(HookKind::Agent.path(), "/hooks/agent");
        assert_eq!(HookKind::Wake.path(), "/hooks/wake");
    }

    #[test]
    fn auth_present_reflects_token() {
        let with_token = WebhookClient::new(Some("http://x".into()), Some("t".into()), "Authorization".into(), 1, 0);
        assert!(with_token.auth_present());
        let without = WebhookClient::new(Some("http://x".into()), None, "Authorization".into(), 1, 0);
        assert!(!without.auth_present());
    }
}
