// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use lettre::address::Envelope;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::debug;
use regex::Regex;

use crate::error::MailerError;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound mail submission.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, from: &str, to: &[String], msg: &[u8]) -> Result<(), MailerError>;
}

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,4}$")
        .expect("static email regex");
}

fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Relays the already-normalized MIME message to the configured SMTP host.
pub struct SmtpMailer {
    host: String,
    port: u16,
}

impl SmtpMailer {
    pub fn new(host: &str, port: u16) -> Self {
        SmtpMailer {
            host: host.to_string(),
            port,
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, from: &str, to: &[String], msg: &[u8]) -> Result<(), MailerError> {
        if !validate_email(from) {
            return Err(MailerError::InvalidAddress(from.to_string()));
        }
        if to.is_empty() {
            return Err(MailerError::EmptyRecipients);
        }
        for rcpt in to {
            if !validate_email(rcpt) {
                return Err(MailerError::InvalidAddress(rcpt.to_string()));
            }
        }
        if msg.is_empty() {
            return Err(MailerError::EmptyMessage);
        }

        let sender: Address = from
            .parse()
            .map_err(|_| MailerError::InvalidAddress(from.to_string()))?;
        let mut rcpts = Vec::with_capacity(to.len());
        for rcpt in to {
            rcpts.push(
                rcpt.parse::<Address>()
                    .map_err(|_| MailerError::InvalidAddress(rcpt.to_string()))?,
            );
        }
        let envelope =
            Envelope::new(Some(sender), rcpts).map_err(|e| MailerError::Smtp(e.to_string()))?;

        debug!("Relaying {} bytes to {}:{}", msg.len(), self.host, self.port);
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
            .port(self.port)
            .timeout(Some(SEND_TIMEOUT))
            .build();
        transport
            .send_raw(&envelope, msg)
            .await
            .map_err(|e| MailerError::Smtp(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(validate_email("alice@example.com"));
        assert!(validate_email("a.b+c@mail.example.org"));
        assert!(!validate_email("not-an-address"));
        assert!(!validate_email("Alice <alice@example.com>"));
    }
}
