//! Routes live subscription events to the channel funnels.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::ChannelId;

use crate::channel::LiveMessage;
use crate::pipeline::IngestRequest;
use crate::shutdown::shutdown_signalled;
use crate::worker::ChannelHandle;

/// Counters for one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveReport {
    pub received: u64,
    pub dispatched: u64,
    /// Events for channels that were not resolved at startup.
    pub unknown_channel: u64,
    /// Events whose funnel had already shut down.
    pub rejected: u64,
}

pub struct LiveDispatcher {
    routes: HashMap<ChannelId, ChannelHandle>,
}

impl LiveDispatcher {
    pub fn new(handles: impl IntoIterator<Item = ChannelHandle>) -> Self {
        let routes = handles
            .into_iter()
            .map(|handle| (handle.channel().clone(), handle))
            .collect();
        Self { routes }
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.routes.keys()
    }

    /// Queue one live message on its channel's funnel.
    ///
    /// Does not wait for the message to be ingested, only for queue space.
    pub async fn dispatch(&self, live: LiveMessage) -> Result<(), FeedkeeperError> {
        let Some(handle) = self.routes.get(&live.channel) else {
            return Err(FeedkeeperError::Channel(format!(
                "No route for channel {}",
                live.channel
            )));
        };
        debug!(channel = %live.channel, message_id = live.message.id, "Live message received");
        handle
            .enqueue(IngestRequest::live(live.channel, live.message))
            .await
    }

    /// Dispatch until the subscription closes `events` or shutdown is
    /// requested. Consumes the dispatcher so its producer handles are
    /// dropped on return.
    ///
    /// Shutdown closes `events` to new messages; messages the source had
    /// already delivered are still dispatched.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LiveMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LiveReport {
        let mut report = LiveReport::default();

        loop {
            let live = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => {
                    events.close();
                    let mut drained = 0u64;
                    while let Some(live) = events.recv().await {
                        drained += 1;
                        self.route(live, &mut report).await;
                    }
                    info!(drained, "Live feed closed by shutdown");
                    break;
                }
                next = events.recv() => match next {
                    Some(live) => live,
                    None => break,
                },
            };
            self.route(live, &mut report).await;
        }

        info!(
            received = report.received,
            dispatched = report.dispatched,
            unknown_channel = report.unknown_channel,
            rejected = report.rejected,
            "Live dispatcher stopped"
        );
        report
    }

    async fn route(&self, live: LiveMessage, report: &mut LiveReport) {
        report.received += 1;

        if !self.routes.contains_key(&live.channel) {
            report.unknown_channel += 1;
            warn!(
                channel = %live.channel,
                message_id = live.message.id,
                "Live message for an unknown channel dropped"
            );
            return;
        }

        let channel = live.channel.clone();
        let message_id = live.message.id;
        match self.dispatch(live).await {
            Ok(()) => report.dispatched += 1,
            Err(e) => {
                report.rejected += 1;
                warn!(channel = %channel, message_id, error = %e, "Live message rejected");
            }
        }
    }
}
