//! facer-attendance — Face-verified, location-gated attendance.
//!
//! Wires the `facer-core` primitives to injected collaborators: a
//! document store for templates, sessions and attendance records, a
//! device location provider, and an inference engine thread.

pub mod engine;
pub mod error;
pub mod location;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod workflow;

pub use engine::{spawn_engine, EngineError, EngineHandle, FaceEmbedder};
pub use error::AttendanceError;
pub use location::{FixedLocation, LocationError, LocationProvider};
pub use session::{load_session, save_session, Session};
pub use sqlite::SqliteStore;
pub use store::{DocumentStore, FieldValue, MemoryStore, StoreError};
pub use workflow::{
    attendance_status, roster, AttendanceOutcome, AttendanceRecord, AttendanceWorkflow,
    WorkflowSettings,
};
