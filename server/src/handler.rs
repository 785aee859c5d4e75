//! Per-message handling for an established device session

use crate::error::CoreError;
use crate::registry::{DeviceUpdate, UpsertOutcome};
use crate::session::SessionHandle;
use crate::station::BaseStation;
use fleet_shared::{Ack, Envelope, IssueReport, Message, Role, BASE_STATION_ID};
use tracing::{debug, info, warn};

/// Apply one inbound envelope. Returns the reply to send on the session, if any.
pub async fn handle_envelope(
    station: &BaseStation,
    session: &SessionHandle,
    envelope: Envelope,
) -> Option<Envelope> {
    station.packets.record_inbound(session.addr, &envelope).await;

    let device_id = session.device_id.as_str();
    if envelope.sender_id != device_id {
        warn!(
            device_id,
            sender_id = %envelope.sender_id,
            "sender_id does not match session, using session identity"
        );
    }

    let outcome = refresh_device(station, session, &envelope.message).await;
    if session.role == Role::Robot && outcome == UpsertOutcome::Revived {
        info!(device_id, "robot back from stale");
        station.coordinator.robot_available(device_id);
    }

    match envelope.message {
        Message::Discovery(_) => {
            debug!(device_id, "repeated DISCOVERY on open session");
            Some(Envelope::discovery_ack(Ack::ok("already registered", None)))
        }
        Message::Heartbeat(_) | Message::Status(_) => {
            debug!(device_id, message_type = %envelope.message.message_type(), "liveness updated");
            None
        }
        Message::IssueReport(report) => Some(reply(report_issue(station, device_id, report).await)),
        Message::TaskCompleted(done) => {
            let ack = match station.coordinator.complete(&done.task_id, device_id).await {
                Ok(task) => Ack::ok(format!("task {} is {}", task.id, task.status), Some(task.id)),
                Err(e) => {
                    warn!(device_id, task_id = %done.task_id, error = %e, "completion rejected");
                    Ack::failed(e.to_string())
                }
            };
            Some(reply(ack))
        }
        Message::Ack(ack) => {
            debug!(device_id, ok = ack.ok, message = %ack.message, "device acknowledged");
            None
        }
        Message::Directive(_) | Message::MovementCommand(_) => {
            warn!(device_id, message_type = %envelope.message.message_type(), "devices may not send commands, ignored");
            None
        }
    }
}

async fn refresh_device(station: &BaseStation, session: &SessionHandle, message: &Message) -> UpsertOutcome {
    match message {
        Message::Discovery(_) | Message::Heartbeat(_) | Message::Status(_) => {
            let update = DeviceUpdate {
                addr: Some(session.addr.ip()),
                ..DeviceUpdate::from_message(message)
            };
            station.registry.upsert(&session.device_id, session.role, update).await
        }
        _ => match station.registry.touch(&session.device_id).await {
            Ok(outcome) => outcome,
            // Known from the handshake; only reachable if the registry was reset
            Err(_) => {
                station
                    .registry
                    .upsert(&session.device_id, session.role, DeviceUpdate::default())
                    .await
            }
        },
    }
}

async fn report_issue(station: &BaseStation, device_id: &str, report: IssueReport) -> Ack {
    let issue_type = match (&report.issue_type, &report.qr_code) {
        (Some(issue_type), _) => Ok(issue_type.clone()),
        (None, Some(qr)) => station.resolver.resolve_qr(qr).map(str::to_string),
        (None, None) => Err(CoreError::MalformedMessage("issue report without issue type".into())),
    };

    let result = match issue_type {
        Ok(issue_type) => {
            station
                .coordinator
                .report_issue(device_id, &issue_type, report.coordinates)
                .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(task) => Ack::ok(
            format!("task {} created for {} ({})", task.id, task.issue_type, task.status),
            Some(task.id),
        ),
        Err(e) => {
            warn!(device_id, error = %e, "issue report rejected");
            Ack::failed(e.to_string())
        }
    }
}

fn reply(ack: Ack) -> Envelope {
    Envelope::message(BASE_STATION_ID, Message::Ack(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing::{connect_device, test_station, RecordingLink};
    use fleet_shared::state_machine::TaskStatus;
    use fleet_shared::{Heartbeat, TaskCompleted};
    use std::sync::Arc;

    fn ack_of(envelope: Option<Envelope>) -> Ack {
        match envelope.map(|e| e.message) {
            Some(Message::Ack(ack)) => ack,
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_issue_report_by_qr_code() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let drone = connect_device(&station, "D1", Role::Drone).await;
        let _robot = connect_device(&station, "R1", Role::Robot).await;

        let report = IssueReport {
            qr_code: Some("ANTENNA_QR".into()),
            ..Default::default()
        };
        let envelope = Envelope::message("D1", Message::IssueReport(report));
        let ack = ack_of(handle_envelope(&station, &drone.handle, envelope).await);
        assert!(ack.ok, "{}", ack.message);

        let task = station.coordinator.get(ack.reference.as_deref().unwrap()).await.unwrap();
        assert_eq!(task.issue_type, "tilted_antenna");
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.reported_by, "D1");
    }

    #[tokio::test]
    async fn test_unknown_issue_type_is_a_failed_ack() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let drone = connect_device(&station, "D1", Role::Drone).await;

        let report = IssueReport {
            issue_type: Some("rust_and_antenna".into()),
            ..Default::default()
        };
        let ack = ack_of(
            handle_envelope(&station, &drone.handle, Envelope::message("D1", Message::IssueReport(report))).await,
        );
        assert!(!ack.ok);
        assert!(ack.message.contains("rust_and_antenna"));
        assert!(station.coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_flow() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let robot = connect_device(&station, "R1", Role::Robot).await;
        let task = station.coordinator.report_issue("D1", "rust", None).await.unwrap();

        let done = TaskCompleted {
            task_id: task.id.clone(),
            status: Some("completed".into()),
            message: None,
        };
        let ack = ack_of(
            handle_envelope(&station, &robot.handle, Envelope::message("R1", Message::TaskCompleted(done.clone()))).await,
        );
        assert!(ack.ok);
        assert_eq!(station.coordinator.get(&task.id).await.unwrap().status, TaskStatus::Done);

        // A repeated completion is acknowledged again
        let ack = ack_of(
            handle_envelope(&station, &robot.handle, Envelope::message("R1", Message::TaskCompleted(done))).await,
        );
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_registry() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let robot = connect_device(&station, "R1", Role::Robot).await;

        let heartbeat = Heartbeat::new(Some(15), None, None);
        let reply = handle_envelope(&station, &robot.handle, Envelope::message("R1", Message::Heartbeat(heartbeat))).await;
        assert!(reply.is_none());

        let device = station.registry.get("R1").await.unwrap();
        assert_eq!(device.battery, Some(15));
        assert_eq!(device.status, "BATTERY_LOW");
        assert_eq!(station.packets.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_robot_heartbeat_publishes_availability() {
        let (station, mut worker) = test_station(Arc::new(RecordingLink::default()));
        let robot = connect_device(&station, "R1", Role::Robot).await;
        station.registry.mark_stale("R1").await;

        let task = station.coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Unclaimed);

        let heartbeat = Envelope::message("R1", Message::Heartbeat(Heartbeat::default()));
        handle_envelope(&station, &robot.handle, heartbeat).await;
        assert!(worker.step().await);

        assert_eq!(station.coordinator.get(&task.id).await.unwrap().status, TaskStatus::Claimed);
    }
}
