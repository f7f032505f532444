// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single broker connection of a broker handle. It
//! establishes the connection, watches for the broker closing it, and releases
//! channel and connection on request.
//!
//! The connection and the channel derived from it live in one shared
//! [`LinkState`]. The [`crate::channel::ChannelSupervisor`] reads the same
//! state to hand out channels.

use crate::{
    channel::ChannelSupervisor,
    config::AmqpConfigs,
    diagnostics::{DiagnosticEvent, DiagnosticsBus},
    errors::AmqpError,
    topology::DeclaredTopology,
    transport::{AmqpChannel, AmqpConnection, AmqpConnector},
};
use lapin::uri::AMQPUri;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection and channel slots shared by the connection manager and the
/// channel supervisor.
///
/// `generation` is bumped on every connect and close so that a close
/// notification from a superseded connection is ignored.
#[derive(Default)]
pub(crate) struct LinkState {
    pub(crate) connection: Option<Arc<dyn AmqpConnection>>,
    pub(crate) channel: Option<Arc<dyn AmqpChannel>>,
    pub(crate) lost: bool,
    pub(crate) generation: u64,
}

pub(crate) type SharedLink = Arc<RwLock<LinkState>>;

/// Owns the broker connection.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn AmqpConnector>,
    link: SharedLink,
    declared: DeclaredTopology,
    diagnostics: DiagnosticsBus,
    connection_name: String,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn AmqpConnector>, diagnostics: DiagnosticsBus) -> Self {
        ConnectionManager {
            connector,
            link: SharedLink::default(),
            declared: DeclaredTopology::default(),
            diagnostics,
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
        }
    }

    /// Sets the name reported to the broker for every new connection.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Returns a channel supervisor working on this manager's connection.
    pub fn channels(&self) -> ChannelSupervisor {
        ChannelSupervisor::new(self.link.clone(), self.diagnostics.clone())
    }

    /// Registry of the objects declared over the current connection.
    pub(crate) fn declared(&self) -> DeclaredTopology {
        self.declared.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .read()
            .connection
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Connects using the URI built from `cfg`.
    pub async fn connect_with(&self, cfg: &AmqpConfigs) -> Result<(), AmqpError> {
        self.connect(&cfg.uri()).await
    }

    /// Establishes the connection to `url`.
    ///
    /// An empty or unparsable URL is rejected before the broker is contacted.
    /// An existing connection is replaced and closed; its channel is dropped.
    pub async fn connect(&self, url: &str) -> Result<(), AmqpError> {
        let result = self.open(url).await;
        self.diagnostics.mirror(result)
    }

    async fn open(&self, url: &str) -> Result<(), AmqpError> {
        validate_url(url)?;

        debug!("creating amqp connection...");
        let conn = self
            .connector
            .connect(url, &self.connection_name)
            .await
            .map_err(|err| AmqpError::ConnectionError(err.0))?;

        let (generation, previous_channel, previous_conn) = {
            let mut link = self.link.write();
            link.generation += 1;
            link.lost = false;
            let previous_channel = link.channel.take();
            let previous_conn = link.connection.replace(conn.clone());
            (link.generation, previous_channel, previous_conn)
        };
        self.declared.clear();

        self.watch(conn.as_ref(), generation);
        info!(generation, "amqp connected");

        if previous_conn.is_some() {
            debug!("replacing the previous amqp connection");
            self.release(previous_channel, previous_conn).await;
        }

        Ok(())
    }

    /// Registers the close observer for the connection of `generation`.
    fn watch(&self, conn: &dyn AmqpConnection, generation: u64) {
        let link = Arc::downgrade(&self.link);
        let diagnostics = self.diagnostics.clone();

        conn.on_close(Box::new(move |reason| {
            let Some(link) = link.upgrade() else {
                return;
            };

            {
                let mut state = link.write();
                if state.generation != generation {
                    return;
                }
                state.connection = None;
                state.channel = None;
                state.lost = true;
            }

            warn!(reason = reason.as_str(), "amqp connection closed by the broker");
            diagnostics.emit(DiagnosticEvent::ConnectionClosed {
                reason: Some(reason),
            });
        }));
    }

    /// Releases the channel and then the connection.
    ///
    /// Failures are reported to the diagnostics bus and never returned;
    /// closing an already closed manager does nothing.
    pub async fn close(&self) {
        let (channel, conn) = {
            let mut link = self.link.write();
            link.generation += 1;
            link.lost = false;
            (link.channel.take(), link.connection.take())
        };
        self.declared.clear();

        if conn.is_none() && channel.is_none() {
            debug!("amqp connection already closed");
            return;
        }

        self.release(channel, conn).await;
        info!("amqp connection closed");
        self.diagnostics
            .emit(DiagnosticEvent::ConnectionClosed { reason: None });
    }

    async fn release(
        &self,
        channel: Option<Arc<dyn AmqpChannel>>,
        conn: Option<Arc<dyn AmqpConnection>>,
    ) {
        if let Some(channel) = channel.filter(|c| c.is_open()) {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close the channel");
                self.diagnostics.error(&AmqpError::ChannelError(err.0));
            }
        }

        if let Some(conn) = conn.filter(|c| c.is_connected()) {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close the connection");
                self.diagnostics.error(&AmqpError::ConnectionError(err.0));
            }
        }
    }
}

fn validate_url(url: &str) -> Result<(), AmqpError> {
    if url.trim().is_empty() {
        return Err(AmqpError::ConnectionError("missing broker url".to_owned()));
    }

    url.parse::<AMQPUri>()
        .map(|_| ())
        .map_err(|err| AmqpError::ConnectionError(format!("malformed broker url: {err}")))
}
