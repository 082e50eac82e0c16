use crate::dlna::DeviceEvent;
use crate::tasks::types::TaskResult;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum TaskEvent {
    Executing { key: String, name: String },
    Progress { key: String, percent: f64 },
    Completed(TaskResult),
}

#[derive(Clone, Debug)]
pub enum Event {
    Task(TaskEvent),
    Device(DeviceEvent),
}

impl From<TaskEvent> for Event {
    fn from(event: TaskEvent) -> Self {
        Event::Task(event)
    }
}

impl From<DeviceEvent> for Event {
    fn from(event: DeviceEvent) -> Self {
        Event::Device(event)
    }
}

/// Fire-and-forget fan-out of engine events. Publishing never blocks and
/// never fails; events published with no subscriber are dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: impl Into<Event>) {
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
