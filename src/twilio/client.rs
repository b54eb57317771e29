use crate::config::TwilioConfig;

/// Outcome of an outbound call attempt.
///
/// `Skipped` is the deliberate no-crash degrade path when carrier
/// credentials are absent; callers continue in degraded mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(String),
    Skipped,
    Errored(String),
}

/// Thin client for the carrier's call-control REST API: start a call leg and
/// redirect a live leg to a new instruction document. Both operations are
/// single-attempt and fire-and-forget; provider-side retries are the
/// provider's concern.
pub struct CallControlClient {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl CallControlClient {
    pub fn new(twilio_config: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty()
    }

    /// Start an outbound call leg answered by `instruction_url`. Terminal
    /// status events for the leg are POSTed to `status_callback_url`.
    pub async fn start_call(
        &self,
        to: &str,
        instruction_url: &str,
        status_callback_url: Option<&str>,
    ) -> StartOutcome {
        if !self.is_configured() {
            tracing::info!(to, "Carrier credentials absent, outbound call skipped");
            return StartOutcome::Skipped;
        }

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.account_sid
        );

        let mut params = vec![
            ("To", to.to_string()),
            ("From", self.from_number.clone()),
            ("Url", instruction_url.to_string()),
            ("Method", "POST".to_string()),
        ];
        if let Some(cb) = status_callback_url {
            params.push(("StatusCallback", cb.to_string()));
            params.push(("StatusCallbackMethod", "POST".to_string()));
        }

        let resp = match self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(to, "Outbound call request failed: {e}");
                return StartOutcome::Errored(e.to_string());
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(to, %status, "Carrier rejected outbound call: {body}");
            return StartOutcome::Errored(format!("{status}: {body}"));
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return StartOutcome::Errored(e.to_string()),
        };

        let call_sid = body["sid"].as_str().unwrap_or("unknown").to_string();
        tracing::info!(to, call_sid = %call_sid, "Outbound call initiated");
        StartOutcome::Started(call_sid)
    }

    /// Redirect a live leg to a new instruction document. Best-effort: the
    /// return value only says whether the carrier accepted the redirect, not
    /// whether the leg executed it.
    pub async fn redirect_call(&self, call_sid: &str, instruction_url: &str) -> bool {
        if !self.is_configured() {
            tracing::info!(call_sid, "Carrier credentials absent, redirect skipped");
            return false;
        }

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{}.json",
            self.account_sid, call_sid
        );

        let params = [("Url", instruction_url), ("Method", "POST")];

        match self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(call_sid, instruction_url, "Call redirected");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(call_sid, %status, "Redirect rejected: {body}");
                false
            }
            Err(e) => {
                tracing::warn!(call_sid, "Redirect request failed: {e}");
                false
            }
        }
    }
}
