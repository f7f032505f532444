// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Handle
//!
//! [`AmqpBroker`] ties the components together around one connection. It is
//! created explicitly by the caller and cloned wherever it is needed; there is
//! no global instance, so independent brokers can coexist.

use crate::{
    amqp::LapinConnector,
    channel::ChannelSupervisor,
    config::AmqpConfigs,
    connection::ConnectionManager,
    diagnostics::{DiagnosticEvent, DiagnosticsBus},
    dispatcher::ConsumeDispatcher,
    errors::AmqpError,
    publisher::PublishGateway,
    topology::{DeclaredTopology, TopologyConfigurator},
    transport::{AmqpChannel, AmqpConnector},
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One supervised broker connection and the components working on it.
#[derive(Clone)]
pub struct AmqpBroker {
    connection: ConnectionManager,
    channels: ChannelSupervisor,
    declared: DeclaredTopology,
    diagnostics: DiagnosticsBus,
}

impl AmqpBroker {
    /// Creates a broker using `connector` to reach the server.
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self::with_diagnostics(connector, DiagnosticsBus::default())
    }

    pub fn with_diagnostics(connector: Arc<dyn AmqpConnector>, diagnostics: DiagnosticsBus) -> Self {
        let connection = ConnectionManager::new(connector, diagnostics.clone());
        Self::assemble(connection, diagnostics)
    }

    /// Creates a `lapin` backed broker configured from `cfg`. Call
    /// [`AmqpBroker::connect_with`] to open the connection.
    pub fn from_configs(cfg: &AmqpConfigs) -> Self {
        let diagnostics = DiagnosticsBus::new(cfg.diagnostics_capacity);
        let connection = ConnectionManager::new(Arc::new(LapinConnector::new()), diagnostics.clone())
            .with_connection_name(&cfg.connection_name);
        Self::assemble(connection, diagnostics)
    }

    fn assemble(connection: ConnectionManager, diagnostics: DiagnosticsBus) -> Self {
        let channels = connection.channels();
        let declared = connection.declared();

        AmqpBroker {
            connection,
            channels,
            declared,
            diagnostics,
        }
    }

    pub async fn connect(&self, url: &str) -> Result<(), AmqpError> {
        self.connection.connect(url).await
    }

    pub async fn connect_with(&self, cfg: &AmqpConfigs) -> Result<(), AmqpError> {
        self.connection.connect_with(cfg).await
    }

    /// Closes channel and connection; never fails, see [`ConnectionManager::close`].
    pub async fn close(&self) {
        self.connection.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn ensure_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.channels.ensure_channel().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn channels(&self) -> &ChannelSupervisor {
        &self.channels
    }

    pub fn diagnostics(&self) -> &DiagnosticsBus {
        &self.diagnostics
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    pub fn topology(&self) -> TopologyConfigurator {
        TopologyConfigurator::new(
            self.channels.clone(),
            self.declared.clone(),
            self.diagnostics.clone(),
        )
    }

    pub fn publisher(&self) -> PublishGateway {
        PublishGateway::new(
            self.channels.clone(),
            self.declared.clone(),
            self.diagnostics.clone(),
        )
    }

    pub fn dispatcher(&self) -> ConsumeDispatcher {
        ConsumeDispatcher::new(self.channels.clone(), self.diagnostics.clone())
    }
}
