//! Answering searches from the server or the distributed network with local results.

use std::sync::Arc;

use parking_lot::RwLock;
use slsk_core::peer::SearchReply;
use slsk_core::{ResultFilter, ShareIndex};
use tracing::{debug, trace};

use crate::race::SearchResponder;

pub struct LocalSearch {
    own_username: String,
    shares: Arc<dyn ShareIndex>,
    filter: RwLock<ResultFilter>,
    responder: Arc<SearchResponder>,
}

impl LocalSearch {
    pub fn new(
        own_username: impl Into<String>,
        shares: Arc<dyn ShareIndex>,
        filter: ResultFilter,
        responder: Arc<SearchResponder>,
    ) -> Self {
        Self {
            own_username: own_username.into(),
            shares,
            filter: RwLock::new(filter),
            responder,
        }
    }

    pub fn shares(&self) -> &Arc<dyn ShareIndex> {
        &self.shares
    }

    pub fn set_excluded_phrases(&self, phrases: Vec<String>) {
        debug!(count = phrases.len(), "excluded search phrases updated");
        self.filter.write().set_excluded_phrases(phrases);
    }

    /// Filtered local matches, wrapped as the reply `username` would receive.
    /// `None` when there is nothing to send.
    pub fn reply_for(&self, token: u32, query: &str) -> Option<SearchReply> {
        let files = self.filter.read().search(self.shares.as_ref(), query);
        if files.is_empty() {
            trace!(token, query, "no local matches");
            return None;
        }
        Some(SearchReply {
            username: self.own_username.clone(),
            token,
            files,
            free_slot: true,
            avg_speed: 0,
            queue_length: 0,
            private_files: Vec::new(),
        })
    }

    /// Search locally and, if anything matched, deliver the reply on a background task.
    pub fn answer(&self, username: String, token: u32, query: &str) {
        let Some(reply) = self.reply_for(token, query) else {
            return;
        };
        let responder = self.responder.clone();
        tokio::spawn(async move {
            if let Err(e) = responder.respond(&username, reply).await {
                debug!(%username, token, error = %e, "could not deliver search results");
            }
        });
    }
}
