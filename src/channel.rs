// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Supervision
//!
//! This module hands out the single channel of a broker handle. The channel is
//! created lazily from the live connection and recreated on demand after it
//! was lost; the connection itself is never re-established here.
//!
//! Components must call [`ChannelSupervisor::ensure_channel`] right before each
//! broker operation instead of keeping the channel around, because the broker
//! may close it at any time.

use crate::{
    connection::SharedLink,
    diagnostics::{DiagnosticEvent, DiagnosticsBus},
    errors::AmqpError,
    transport::AmqpChannel,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Lazily creates and caches the channel of one connection.
#[derive(Clone)]
pub struct ChannelSupervisor {
    link: SharedLink,
    diagnostics: DiagnosticsBus,
}

impl ChannelSupervisor {
    pub(crate) fn new(link: SharedLink, diagnostics: DiagnosticsBus) -> Self {
        ChannelSupervisor { link, diagnostics }
    }

    /// Returns a live channel.
    ///
    /// The cached channel is returned as long as it is open. Otherwise a new
    /// one is created from the connection. Fails with
    /// [`AmqpError::ChannelUnavailable`] when there is no connection and with
    /// [`AmqpError::ConnectionClosed`] when the broker dropped it.
    pub async fn ensure_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let (conn, generation) = {
            let link = self.link.read();

            if let Some(channel) = link.channel.as_ref().filter(|c| c.is_open()) {
                return Ok(channel.clone());
            }

            match &link.connection {
                Some(conn) => (conn.clone(), link.generation),
                None if link.lost => return Err(AmqpError::ConnectionClosed),
                None => return Err(AmqpError::ChannelUnavailable),
            }
        };

        if !conn.is_connected() {
            self.mark_lost(generation);
            return Err(AmqpError::ConnectionClosed);
        }

        debug!("creating amqp channel...");
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.0)
        })?;

        let mut link = self.link.write();
        if link.generation != generation {
            // The connection was closed or replaced while the channel was opening.
            return Err(AmqpError::ConnectionClosed);
        }
        link.channel = Some(channel.clone());
        debug!("channel created");

        Ok(channel)
    }

    /// Drops the cached channel; the next `ensure_channel` creates a new one.
    pub fn invalidate(&self) {
        if self.link.write().channel.take().is_some() {
            debug!("channel invalidated");
        }
    }

    /// True when a channel is cached and open.
    pub fn has_channel(&self) -> bool {
        self.link
            .read()
            .channel
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Treats a connection reporting itself dead as closed by the broker.
    fn mark_lost(&self, generation: u64) {
        {
            let mut link = self.link.write();
            if link.generation != generation || link.connection.is_none() {
                return;
            }
            link.connection = None;
            link.channel = None;
            link.lost = true;
        }

        warn!("amqp connection is no longer alive");
        self.diagnostics.emit(DiagnosticEvent::ConnectionClosed {
            reason: Some("connection is no longer alive".to_owned()),
        });
    }
}
