use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::NotificationSink;

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01/Accounts";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Twilio credentials and numbers.
#[derive(Clone)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    pub to: String,
}

impl TwilioSettings {
    /// Read `TWILIO_SID`, `TWILIO_TOKEN`, `TWILIO_FROM`, `ALERT_TO`.
    ///
    /// Returns the names of the missing variables on failure.
    pub fn from_env() -> std::result::Result<Self, Vec<&'static str>> {
        let read = |key: &'static str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let sid = read("TWILIO_SID");
        let token = read("TWILIO_TOKEN");
        let from = read("TWILIO_FROM");
        let to = read("ALERT_TO");
        match (sid, token, from, to) {
            (Some(account_sid), Some(auth_token), Some(from), Some(to)) => Ok(Self {
                account_sid,
                auth_token,
                from,
                to,
            }),
            (sid, token, from, to) => {
                let missing = [
                    ("TWILIO_SID", sid.is_none()),
                    ("TWILIO_TOKEN", token.is_none()),
                    ("TWILIO_FROM", from.is_none()),
                    ("ALERT_TO", to.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect();
                Err(missing)
            }
        }
    }

    /// Account SID with all but the last four characters hidden.
    pub fn masked_sid(&self) -> String {
        let tail: String = self
            .account_sid
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", tail)
    }
}

/// Sends SMS alerts through the Twilio REST API.
pub struct TwilioSms {
    settings: TwilioSettings,
    endpoint: Url,
    agent: ureq::Agent,
}

impl TwilioSms {
    pub fn new(settings: TwilioSettings) -> Result<Self> {
        let mut endpoint = Url::parse(&format!(
            "{}/{}/Messages.json",
            TWILIO_API, settings.account_sid
        ))
        .context("build twilio endpoint")?;
        endpoint
            .set_username(&settings.account_sid)
            .map_err(|_| anyhow!("twilio endpoint rejects credentials"))?;
        endpoint
            .set_password(Some(&settings.auth_token))
            .map_err(|_| anyhow!("twilio endpoint rejects credentials"))?;
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self {
            settings,
            endpoint,
            agent,
        })
    }
}

impl NotificationSink for TwilioSms {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn deliver(&mut self, text: &str) -> Result<()> {
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .send_form(&[
                ("To", self.settings.to.as_str()),
                ("From", self.settings.from.as_str()),
                ("Body", text),
            ])
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => anyhow!("twilio rejected message: HTTP {}", code),
                other => anyhow!("twilio request failed: {}", other),
            })?;
        log::info!(
            "SMS sent to {} (HTTP {})",
            self.settings.to,
            response.status()
        );
        Ok(())
    }
}

/// Alert sink used when SMS is not configured.
pub struct LogOnlyAlert;

impl NotificationSink for LogOnlyAlert {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn deliver(&mut self, text: &str) -> Result<()> {
        log::warn!("[SMS NOT SENT] {}", text);
        Ok(())
    }
}

/// Twilio sink when the environment is complete, otherwise log-only.
pub fn alert_sink_from_env() -> Result<Box<dyn NotificationSink>> {
    match TwilioSettings::from_env() {
        Ok(settings) => {
            log::info!(
                "SMS alerts enabled (account {}, to {})",
                settings.masked_sid(),
                settings.to
            );
            Ok(Box::new(TwilioSms::new(settings)?))
        }
        Err(missing) => {
            log::warn!(
                "SMS alerts disabled; missing {}. Alerts will be logged only.",
                missing.join(", ")
            );
            Ok(Box::new(LogOnlyAlert))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TwilioSettings {
        TwilioSettings {
            account_sid: "AC0123456789abcdef".into(),
            auth_token: "secret".into(),
            from: "+15550000000".into(),
            to: "+15551111111".into(),
        }
    }

    #[test]
    fn sid_is_masked() {
        assert_eq!(settings().masked_sid(), "****cdef");
    }

    #[test]
    fn endpoint_carries_account_and_credentials() {
        let sms = TwilioSms::new(settings()).unwrap();
        assert_eq!(sms.endpoint.username(), "AC0123456789abcdef");
        assert_eq!(sms.endpoint.password(), Some("secret"));
        assert!(sms
            .endpoint
            .path()
            .ends_with("/Accounts/AC0123456789abcdef/Messages.json"));
    }

    #[test]
    fn log_only_sink_never_fails() {
        assert!(LogOnlyAlert.deliver("Emergency").is_ok());
    }
}
