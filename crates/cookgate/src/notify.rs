/// One change notification, addressed with the organization's mail settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub from: String,
    pub to: String,
    /// `host:port` of the mail relay.
    pub relay: String,
    pub subject: String,
    pub body: String,
}

impl Notice {
    /// The message as it goes on the wire: headers, a blank line, then the body.
    pub fn message(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}",
            self.from, self.to, self.subject, self.body
        )
    }
}

/// Receives change notifications. Delivery failures are the caller's to log; they never fail a
/// request.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &Notice) -> anyhow::Result<()> {
        tracing::info!(
            event = "config_change",
            to = %notice.to,
            relay = %notice.relay,
            "{}",
            notice.message()
        );
        Ok(())
    }
}
