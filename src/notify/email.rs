use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use crate::config::EmailSettings;
use crate::digest::model::DigestResult;

/// Sends finished digests as plain-text mail over SMTP.
pub struct DigestMailer {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl DigestMailer {
    pub fn from_settings(settings: &EmailSettings) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
            .with_context(|| format!("invalid SMTP host '{}'", settings.host))?;
        if let Some(port) = settings.port {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = settings
            .from
            .parse()
            .with_context(|| format!("invalid sender address '{}'", settings.from))?;
        let to = settings
            .to
            .parse()
            .with_context(|| format!("invalid recipient address '{}'", settings.to))?;

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }

    pub async fn send_digest(&self, digest: &DigestResult) -> Result<()> {
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject(digest))
            .header(header::ContentType::TEXT_PLAIN)
            .body(render_body(digest))
            .context("build email")?;

        self.mailer.send(msg).await.context("send email")?;
        tracing::info!(digest_id = %digest.id, "digest email sent");
        Ok(())
    }
}

pub fn subject(digest: &DigestResult) -> String {
    format!(
        "{} - {}",
        digest.title,
        digest.created_at.format("%-d %B %Y")
    )
}

pub fn render_body(digest: &DigestResult) -> String {
    let mut body = format!(
        "Your digest for {}\n\n{}\n\nPosts: {}\n",
        digest.created_at.format("%-d %B %Y"),
        digest.title,
        digest.posts_count
    );
    if let Some(avg) = digest.average_importance {
        body.push_str(&format!("Average importance: {avg:.1}/10\n"));
    }
    body.push_str(&format!("\n{}\n", digest.overview));
    for (i, p) in digest.post_summaries.iter().enumerate() {
        body.push_str(&format!(
            "\n{}. [{}/10] {}\n   {}\n",
            i + 1,
            p.importance,
            p.summary,
            p.post.url
        ));
    }
    body
}
