//! Wiring of the base station's shared components

use crate::command::{CommandDispatcher, CommandLog};
use crate::config::ServerConfig;
use crate::coordinator::{AvailabilityWorker, TaskCoordinator};
use crate::issues::IssueResolver;
use crate::packets::PacketLog;
use crate::registry::DeviceRegistry;
use crate::session::SessionManager;
use crate::transport::CommandLink;
use std::sync::Arc;
use std::time::Instant;

/// Everything a connection worker or HTTP handler needs
pub struct BaseStation {
    pub config: ServerConfig,
    pub registry: Arc<DeviceRegistry>,
    pub resolver: Arc<IssueResolver>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub coordinator: Arc<TaskCoordinator>,
    pub commands: Arc<CommandLog>,
    pub packets: Arc<PacketLog>,
    pub started_at: Instant,
}

impl BaseStation {
    /// Build the station. The returned worker must be spawned for queued
    /// tasks to be re-scanned when robots free up.
    pub fn new(
        config: ServerConfig,
        resolver: IssueResolver,
        link: Arc<dyn CommandLink>,
    ) -> (Arc<Self>, AvailabilityWorker) {
        let registry = Arc::new(DeviceRegistry::new(config.heartbeat_timeout));
        let resolver = Arc::new(resolver);
        let sessions = Arc::new(SessionManager::new(link, config.retry));
        let commands = Arc::new(CommandLog::new(config.log_capacity));
        let packets = Arc::new(PacketLog::new(config.log_capacity));
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            sessions.clone(),
            commands.clone(),
            packets.clone(),
        ));
        let (coordinator, worker) =
            TaskCoordinator::new(resolver.clone(), registry.clone(), dispatcher.clone());

        let station = Arc::new(Self {
            config,
            registry,
            resolver,
            sessions,
            dispatcher,
            coordinator,
            commands,
            packets,
            started_at: Instant::now(),
        });
        (station, worker)
    }
}
