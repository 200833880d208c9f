//! Well-known fleet event type names.
//!
//! Published on the event bus as `FleetEvent::event_type`. Subscribers
//! match on these rather than on string literals.

// -- tasks --------------------------------------------------------------------

pub const TASK_SUBMITTED: &str = "task.submitted";
pub const TASK_STARTED: &str = "task.started";
pub const TASK_RETRYING: &str = "task.retrying";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_CANCELLED: &str = "task.cancelled";

// -- pool ---------------------------------------------------------------------

pub const INSTANCE_CREATED: &str = "instance.created";
pub const INSTANCE_REMOVED: &str = "instance.removed";
pub const INSTANCE_UNHEALTHY: &str = "instance.unhealthy";
pub const INSTANCE_RECOVERED: &str = "instance.recovered";
pub const INSTANCE_REPLACED: &str = "instance.replaced";

// -- reconciler ---------------------------------------------------------------

pub const DEVICE_RECONNECTED: &str = "device.reconnected";
pub const DEVICE_PORT_CHANGED: &str = "device.port_changed";
pub const DEVICE_REMOVED: &str = "device.removed";
pub const DEVICE_REPAIR_FAILED: &str = "device.repair_failed";
