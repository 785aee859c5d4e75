//! Task coordinator: owns every task and the robot claim critical section

use super::availability::AvailabilityWorker;
use super::task::{Completion, Task};
use crate::command::{Command, CommandDispatcher, ORIGIN_COORDINATOR};
use crate::error::CoreError;
use crate::issues::IssueResolver;
use crate::registry::DeviceRegistry;
use fleet_shared::state_machine::TaskStatus;
use fleet_shared::{MovementCommand, Position};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Default)]
struct TaskBook {
    tasks: HashMap<String, Task>,
    /// Task ids in creation order
    order: Vec<String>,
    /// UNCLAIMED tasks waiting for robots, oldest first
    pending: VecDeque<String>,
    /// Monotonic claim counter; stamped on robots as `last_assigned`
    assign_seq: u64,
}

impl TaskBook {
    fn enqueue(&mut self, task_id: &str) {
        if !self.pending.iter().any(|id| id == task_id) {
            self.pending.push_back(task_id.to_string());
        }
    }

    fn dequeue(&mut self, task_id: &str) {
        self.pending.retain(|id| id != task_id);
    }
}

pub struct TaskCoordinator {
    resolver: Arc<IssueResolver>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    /// Held across select idle robots + mark busy + set claimed_by
    book: Mutex<TaskBook>,
    availability: mpsc::UnboundedSender<String>,
}

impl TaskCoordinator {
    pub fn new(
        resolver: Arc<IssueResolver>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> (Arc<Self>, AvailabilityWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            resolver,
            registry,
            dispatcher,
            book: Mutex::new(TaskBook::default()),
            availability: tx,
        });
        let worker = AvailabilityWorker::new(Arc::downgrade(&coordinator), rx);
        (coordinator, worker)
    }

    /// Create a task for a detected issue and try to staff it right away.
    ///
    /// A task that cannot be staffed yet is returned UNCLAIMED and queued.
    pub async fn report_issue(
        &self,
        sender_id: &str,
        issue_type: &str,
        reported_coordinates: Option<Position>,
    ) -> Result<Task, CoreError> {
        let location = self.resolver.resolve(issue_type)?;
        let task = Task::new(issue_type, location, sender_id, reported_coordinates);
        let task_id = task.id.clone();

        {
            let mut book = self.book.lock().await;
            book.order.push(task_id.clone());
            book.tasks.insert(task_id.clone(), task);
        }
        info!(
            task_id = %task_id,
            issue_type,
            reported_by = sender_id,
            robot_count = location.robot_count,
            "task created"
        );

        match self.assign(&task_id).await {
            Err(CoreError::NoRobotsAvailable { required, available, .. }) => {
                info!(task_id = %task_id, required, available, "no robots available, task queued");
                self.get(&task_id).await
            }
            other => other,
        }
    }

    /// Claim `robot_count` idle robots for an UNCLAIMED task and send them moving.
    ///
    /// Tasks that are already CLAIMED or DONE are returned unchanged.
    pub async fn assign(&self, task_id: &str) -> Result<Task, CoreError> {
        let (task, newly_claimed) = {
            let mut guard = self.book.lock().await;
            self.try_claim(&mut guard, task_id).await?
        };

        if newly_claimed {
            self.dispatch_movement(&task).await;
        }
        Ok(task)
    }

    /// Runs with the book locked
    async fn try_claim(&self, book: &mut TaskBook, task_id: &str) -> Result<(Task, bool), CoreError> {
        let (status, required) = match book.tasks.get(task_id) {
            Some(task) => (task.status, task.robot_count),
            None => return Err(CoreError::UnknownTask(task_id.to_string())),
        };

        if status != TaskStatus::Unclaimed {
            book.dequeue(task_id);
            return self.snapshot(book, task_id).map(|task| (task, false));
        }

        let mut idle = self.registry.idle_robots().await;
        if idle.len() < required {
            book.enqueue(task_id);
            return Err(CoreError::NoRobotsAvailable {
                task_id: task_id.to_string(),
                required,
                available: idle.len(),
            });
        }

        // Least recently assigned first, never-assigned before all others
        idle.sort_by(|a, b| {
            a.last_assigned
                .cmp(&b.last_assigned)
                .then_with(|| a.id.cmp(&b.id))
        });
        let chosen: Vec<String> = idle.into_iter().take(required).map(|d| d.id).collect();

        book.assign_seq += 1;
        let sequence = book.assign_seq;
        self.registry.set_assignment(&chosen, task_id, sequence).await;

        let task = book
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))?;
        let claimed = task.claim(chosen.iter().cloned().collect::<BTreeSet<_>>());
        debug_assert!(claimed);
        let task = task.clone();
        book.dequeue(task_id);

        info!(
            task_id,
            issue_type = %task.issue_type,
            robots = ?chosen,
            "task claimed"
        );
        Ok((task, true))
    }

    fn snapshot(&self, book: &TaskBook, task_id: &str) -> Result<Task, CoreError> {
        book.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))
    }

    /// Tell each claimed robot where to go. Failures never undo the claim.
    async fn dispatch_movement(&self, task: &Task) {
        let sends = task.claimed_by.iter().map(|robot_id| {
            let command = Command::Movement(MovementCommand {
                task_id: task.id.clone(),
                issue_type: task.issue_type.clone(),
                coordinates: task.coordinates,
                command: "move_to_location".into(),
            });
            async move {
                (
                    robot_id,
                    self.dispatcher.send(robot_id, command, ORIGIN_COORDINATOR).await,
                )
            }
        });

        for (robot_id, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                warn!(task_id = %task.id, robot_id = %robot_id, error = %e, "movement command not delivered");
            }
        }
    }

    /// Record a completion report from a claimant robot. Only the reporting
    /// robot is released; the other claimants stay busy until they report.
    pub async fn complete(&self, task_id: &str, device_id: &str) -> Result<Task, CoreError> {
        let (task, completion, released) = {
            let mut guard = self.book.lock().await;
            let task = guard
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))?;

            let completion = task.complete(device_id)?;
            let task = task.clone();
            let released = self
                .registry
                .clear_assignment(&[device_id.to_string()], task_id)
                .await;
            (task, completion, released)
        };

        match completion {
            Completion::Completed => info!(task_id, completed_by = device_id, "task done"),
            Completion::AlreadyDone if released.is_empty() => {
                debug!(task_id, device_id, "duplicate completion ignored")
            }
            Completion::AlreadyDone => info!(task_id, device_id, "claimant finished, robot released"),
        }
        for robot_id in &released {
            self.robot_available(robot_id);
        }
        Ok(task)
    }

    /// Publish that a robot may be able to take work
    pub fn robot_available(&self, robot_id: &str) {
        if self.availability.send(robot_id.to_string()).is_err() {
            debug!(robot_id, "availability worker stopped, event dropped");
        }
    }

    /// Try to staff queued tasks, oldest first, stopping at the first one
    /// that still cannot be staffed. Returns the tasks claimed in this pass.
    pub async fn rescan_pending(&self) -> Vec<Task> {
        let claimed = {
            let mut guard = self.book.lock().await;
            let book = &mut *guard;
            let mut claimed = Vec::new();

            while let Some(task_id) = book.pending.front().cloned() {
                match self.try_claim(book, &task_id).await {
                    Ok((task, true)) => claimed.push(task),
                    Ok((_, false)) => {}
                    Err(CoreError::NoRobotsAvailable { .. }) => break,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "dropping task from pending queue");
                        book.dequeue(&task_id);
                    }
                }
            }
            claimed
        };

        for task in &claimed {
            self.dispatch_movement(task).await;
        }
        claimed
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, CoreError> {
        let book = self.book.lock().await;
        self.snapshot(&book, task_id)
    }

    /// All tasks in creation order
    pub async fn list(&self) -> Vec<Task> {
        let book = self.book.lock().await;
        book.order
            .iter()
            .filter_map(|id| book.tasks.get(id).cloned())
            .collect()
    }

    /// Tasks not yet DONE, in creation order
    pub async fn open_tasks(&self) -> Vec<Task> {
        let mut tasks = self.list().await;
        tasks.retain(|task| task.status.is_open());
        tasks
    }

    pub async fn pending_count(&self) -> usize {
        self.book.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CoreError;
    use crate::station::testing::{connect_device, test_station, RecordingLink};
    use fleet_shared::state_machine::TaskStatus;
    use fleet_shared::{Message, Position, Role};
    use std::collections::{BTreeSet, HashSet};
    use std::sync::Arc;

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_rust_scenario() {
        let link = Arc::new(RecordingLink::default());
        let (station, _worker) = test_station(link.clone());
        let _d1 = connect_device(&station, "D1", Role::Drone).await;
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let coordinator = &station.coordinator;

        let task = coordinator
            .report_issue("D1", "rust", Some(Position::new(3.0, 4.0, 0.0)))
            .await
            .expect("task");
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by, ids(&["R1"]));
        assert_eq!(task.coordinates, Position::new(50.0, 75.0, 10.0));
        assert_eq!(station.registry.get("R1").await.unwrap().task_id, Some(task.id.clone()));

        // R1 got a MOVEMENT_COMMAND for the task
        let movements = link.messages();
        assert_eq!(movements.len(), 1);
        match &movements[0] {
            Message::MovementCommand(m) => {
                assert_eq!(m.task_id, task.id);
                assert_eq!(m.coordinates, Position::new(50.0, 75.0, 10.0));
            }
            other => panic!("unexpected {other:?}"),
        }

        let done = coordinator.complete(&task.id, "R1").await.expect("complete");
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.claimed_by, ids(&["R1"]));
        let r1 = station.registry.get("R1").await.unwrap();
        assert!(r1.task_id.is_none());
        assert!(coordinator.open_tasks().await.is_empty());
        assert_eq!(coordinator.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_enough_robots() {
        let (station, mut worker) = test_station(Arc::new(RecordingLink::default()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let coordinator = &station.coordinator;

        let task = coordinator
            .report_issue("D1", "overheated_circuit", None)
            .await
            .expect("not a failure");
        assert_eq!(task.status, TaskStatus::Unclaimed);
        assert!(task.claimed_by.is_empty());
        assert_eq!(coordinator.pending_count().await, 1);
        // R1 is not held while the task waits
        assert!(station.registry.get("R1").await.unwrap().task_id.is_none());

        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        coordinator.robot_available("R2");
        assert!(worker.step().await);

        let task = coordinator.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by, ids(&["R1", "R2"]));
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_issue_type_creates_nothing() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let err = station
            .coordinator
            .report_issue("D1", "rust_and_antenna", None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownIssueType("rust_and_antenna".into()));
        assert!(station.coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_complete_errors_and_idempotence() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        let coordinator = &station.coordinator;

        assert!(matches!(
            coordinator.complete("no-such-task", "R1").await,
            Err(CoreError::UnknownTask(_))
        ));

        let task = coordinator.report_issue("D1", "rust", None).await.unwrap();
        let claimant = task.claimed_by.iter().next().unwrap().clone();
        let other = if claimant == "R1" { "R2" } else { "R1" };

        assert!(matches!(
            coordinator.complete(&task.id, other).await,
            Err(CoreError::NotClaimant { .. })
        ));

        let first = coordinator.complete(&task.id, &claimant).await.unwrap();
        let second = coordinator.complete(&task.id, &claimant).await.unwrap();
        assert_eq!(first.status, TaskStatus::Done);
        assert_eq!(second.time_completed, first.time_completed);
    }

    #[tokio::test]
    async fn test_completion_releases_only_the_reporting_robot() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        let _r3 = connect_device(&station, "R3", Role::Robot).await;
        let coordinator = &station.coordinator;

        let task = coordinator.report_issue("D1", "overheated_circuit", None).await.unwrap();
        assert_eq!(task.claimed_by, ids(&["R1", "R2"]));

        let done = coordinator.complete(&task.id, "R1").await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(station.registry.get("R1").await.unwrap().task_id.is_none());
        assert_eq!(station.registry.get("R2").await.unwrap().task_id, Some(task.id.clone()));

        // R2 is still working, so a new task cannot take it
        let next = coordinator.report_issue("D1", "overheated_circuit", None).await.unwrap();
        assert_eq!(next.claimed_by, ids(&["R1", "R3"]));
        assert!(!next.claimed_by.contains("R2"));

        let again = coordinator.complete(&task.id, "R2").await.unwrap();
        assert_eq!(again.completed_by.as_deref(), Some("R1"));
        assert_eq!(again.time_completed, done.time_completed);
        assert!(station.registry.get("R2").await.unwrap().task_id.is_none());

        // Repeating the report changes nothing
        coordinator.complete(&task.id, "R2").await.unwrap();
        assert!(station.registry.get("R2").await.unwrap().task_id.is_none());
    }

    #[tokio::test]
    async fn test_least_recently_assigned_first() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        let coordinator = &station.coordinator;

        // Ties break by id
        let first = coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(first.claimed_by, ids(&["R1"]));
        coordinator.complete(&first.id, "R1").await.unwrap();

        // R2 has never been assigned, so it goes next even though R1 is idle
        let second = coordinator.report_issue("D1", "tilted_antenna", None).await.unwrap();
        assert_eq!(second.claimed_by, ids(&["R2"]));
        coordinator.complete(&second.id, "R2").await.unwrap();

        let third = coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(third.claimed_by, ids(&["R1"]));
    }

    #[tokio::test]
    async fn test_stale_robots_are_skipped() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        station.registry.mark_stale("R1").await;

        let task = station.coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(task.claimed_by, ids(&["R2"]));
    }

    #[tokio::test]
    async fn test_rescan_keeps_fifo_order() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let coordinator = &station.coordinator;

        let big = coordinator.report_issue("D1", "overheated_circuit", None).await.unwrap();
        let small = coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(coordinator.pending_count().await, 2);

        // One robot is not enough for the oldest task, and the younger one must wait behind it
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        assert!(coordinator.rescan_pending().await.is_empty());
        assert_eq!(coordinator.get(&small.id).await.unwrap().status, TaskStatus::Unclaimed);

        let _r2 = connect_device(&station, "R2", Role::Robot).await;
        let _r3 = connect_device(&station, "R3", Role::Robot).await;
        let claimed: Vec<String> = coordinator
            .rescan_pending()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(claimed, vec![big.id.clone(), small.id.clone()]);
        assert_eq!(coordinator.get(&big.id).await.unwrap().claimed_by, ids(&["R1", "R2"]));
        assert_eq!(coordinator.get(&small.id).await.unwrap().claimed_by, ids(&["R3"]));
    }

    #[tokio::test]
    async fn test_fresh_report_tries_before_queue() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let coordinator = &station.coordinator;

        let big = coordinator.report_issue("D1", "overheated_circuit", None).await.unwrap();
        let queued = coordinator.report_issue("D1", "rust", None).await.unwrap();
        let _r1 = connect_device(&station, "R1", Role::Robot).await;
        assert!(coordinator.rescan_pending().await.is_empty());

        // A new report is staffed directly; the queue keeps its own order
        let fresh = coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(fresh.status, TaskStatus::Claimed);
        assert_eq!(fresh.claimed_by, ids(&["R1"]));
        assert_eq!(coordinator.get(&queued.id).await.unwrap().status, TaskStatus::Unclaimed);
        assert_eq!(coordinator.get(&big.id).await.unwrap().status, TaskStatus::Unclaimed);
        assert_eq!(coordinator.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_movement_keeps_claim() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::failing()));
        let _r1 = connect_device(&station, "R1", Role::Robot).await;

        let task = station.coordinator.report_issue("D1", "rust", None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);

        let task = station.coordinator.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by, ids(&["R1"]));
        assert!(station.registry.get("R1").await.unwrap().stale);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_double_booking_under_concurrency() {
        let (station, _worker) = test_station(Arc::new(RecordingLink::default()));
        let mut sessions = Vec::new();
        for i in 0..8 {
            sessions.push(connect_device(&station, &format!("R{i}"), Role::Robot).await);
        }

        let mut handles = Vec::new();
        for i in 0..20 {
            let station = station.clone();
            let issue = if i % 3 == 0 { "overheated_circuit" } else { "rust" };
            handles.push(tokio::spawn(async move {
                station.coordinator.report_issue("D1", issue, None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("report accepted");
        }

        let mut booked = HashSet::new();
        let mut claimed_robots = 0;
        for task in station.coordinator.list().await {
            match task.status {
                TaskStatus::Claimed => {
                    assert_eq!(task.claimed_by.len(), task.robot_count);
                    for robot in &task.claimed_by {
                        assert!(booked.insert(robot.clone()), "{robot} double-booked");
                    }
                    claimed_robots += task.claimed_by.len();
                }
                TaskStatus::Unclaimed => assert!(task.claimed_by.is_empty()),
                TaskStatus::Done => unreachable!(),
            }
        }
        assert!(claimed_robots <= 8);
        for robot in station.registry.list(Some(Role::Robot)).await {
            assert_eq!(robot.task_id.is_some(), booked.contains(&robot.id));
        }
    }
}
