//! Event notifications for session coordination
//!
//! 1. **Event Types** (`types.rs`): session lifecycle, dispatch, collection,
//!    decision and worker population events.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub with
//!    filtered subscriptions.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────────┐
//! │ Coordinator  │────▶│  Event Bus   │────▶│ Evolution scheduler, │
//! │  Evolution   │     │  (broadcast) │     │ observers, tests     │
//! └──────────────┘     └──────────────┘     └──────────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::CoordinationEvent;
