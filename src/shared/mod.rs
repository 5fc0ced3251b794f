pub mod events;
pub mod logging;

pub use events::{
    event_channel, spawn_event_logger, AuditRecord, ContainerEvent, EventReceiver, EventSender,
};
