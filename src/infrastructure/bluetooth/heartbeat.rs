//! Heartbeat Engine
//!
//! Re-asserts the active command for as long as the session is connected:
//! write, wait for the completion, wait one interval, write the *current*
//! command again. A failed write ends the loop and is reported to the link
//! state machine. Every await is a cancellation point.

use crate::domain::ActiveCommand;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::link::LinkMessage;
use crate::infrastructure::bluetooth::writer::{
    CompletionReceiver, SessionLink, WriteIssue, WriteSerializer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct Heartbeat {
    link: Arc<SessionLink>,
    writer: Arc<WriteSerializer>,
    intent: ActiveCommand,
    completions: CompletionReceiver,
    interval: Duration,
    report: mpsc::UnboundedSender<LinkMessage>,
}

impl Heartbeat {
    pub fn new(
        link: Arc<SessionLink>,
        completions: CompletionReceiver,
        writer: Arc<WriteSerializer>,
        intent: ActiveCommand,
        interval: Duration,
        report: mpsc::UnboundedSender<LinkMessage>,
    ) -> Self {
        Self {
            link,
            writer,
            intent,
            completions,
            interval,
            report,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let session = self.link.id;
        debug!("Heartbeat started for session {}", session);

        loop {
            // Freshest intent at issue time, never a snapshot from an earlier cycle
            let command = self.intent.get();
            let issued = self.writer.write(&self.link, command.token());
            match issued {
                Ok(WriteIssue::Issued) => debug!("Heartbeat write: {}", command),
                Ok(WriteIssue::Revoked) => break,
                Err(e) => return self.fail(e),
            }

            let completion = self.completions.next().await;
            match completion {
                Some(status) if status.is_success() => {}
                Some(status) => return self.fail(LinkError::WriteFailed(status)),
                None => break,
            }

            tokio::time::sleep(self.interval).await;
        }

        debug!("Heartbeat stopped for session {}", session);
    }

    fn fail(self, error: LinkError) {
        error!("Heartbeat write failed on session {}: {}", self.link.id, error);
        let _ = self.report.send(LinkMessage::WriteFailed {
            session: self.link.id,
            error,
        });
    }
}
