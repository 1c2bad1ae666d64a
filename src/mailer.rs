use std::sync::Arc;

use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};

use crate::errors::Result;

/// Something that delivers a rendered email to a single recipient.
pub trait Transport: Send + Sync {
    fn send(&self, to: &str, subject: &str, html: String) -> Result<()>;
}

/// The SMTP mailer. Cheaply clonable.
#[derive(Clone)]
pub struct Mailer {
    inner: Arc<MailerInner>,
    transport: SmtpTransport,
}

struct MailerInner {
    from: Mailbox,
    reply_to: Mailbox,
}

impl Mailer {
    /// Creates a new `Mailer`, relaying through `host` with STARTTLS.
    pub fn new(
        host: &str,
        port: u16,
        from: &str,
        credentials: Option<(String, String)>,
        reply_to: Option<&str>,
    ) -> Result<Mailer> {
        let mut builder = SmtpTransport::starttls_relay(host)?.port(port);
        if let Some((user, pass)) = credentials {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        let from = from.parse::<Mailbox>()?;
        let reply_to = match reply_to {
            Some(addr) => addr.parse()?,
            None => from.clone(),
        };
        Ok(Mailer {
            transport: builder.build(),
            inner: Arc::new(MailerInner { from, reply_to }),
        })
    }
}

impl Transport for Mailer {
    fn send(&self, to: &str, subject: &str, html: String) -> Result<()> {
        let email = Message::builder()
            .from(self.inner.from.clone())
            .reply_to(self.inner.reply_to.clone())
            .to(to.trim().parse()?)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(String::new(), html))?;
        let response = self.transport.send(&email)?;
        debug!("Relayed mail to {} ({})", to, response.code());
        Ok(())
    }
}

/// A transport that logs messages instead of sending them.
#[derive(Clone, Debug, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn send(&self, to: &str, subject: &str, html: String) -> Result<()> {
        info!("[dry run] To: {} Subject: {:?}", to, subject);
        debug!("[dry run] Body:\n{}", html);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_sender_addresses_are_rejected() {
        assert!(Mailer::new("localhost", 587, "not an address", None, None).is_err());
        assert!(Mailer::new("localhost", 587, "News <news@example.com>", None, None).is_ok());
    }

    #[test]
    fn dry_runs_always_succeed() {
        LogTransport
            .send("ada@example.com", "Hello", "<p>Hi</p>".to_string())
            .expect("send");
    }
}
