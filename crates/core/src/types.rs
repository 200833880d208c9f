/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Tasks are identified by a random UUID assigned at submission.
pub type TaskId = uuid::Uuid;

/// Profiles are keyed by an opaque, store-assigned string.
pub type ProfileId = String;
