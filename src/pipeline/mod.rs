//! Frame pipeline.
//!
//! Frames flow through a fixed chain of stages. Each stage group runs on its
//! own worker thread and is fed through a [`StageQueue`] that carries frame
//! counts only; the frames themselves live in the shared [`FrameTable`].
//!
//! # Architecture
//!
//! ```text
//! [Sensor] ──M2M──► [Stats3a] ──OTF──► [Isp] ──M2M──► [Scaler]
//!     │
//!     ├──► hold list ──► [Reprocessing]    (capture frames)
//!     └──► [Dump]                          (debug)
//! ```
//!
//! # Design
//!
//! - **OTF links** run the downstream stage in the upstream worker, with no
//!   intermediate buffer.
//! - **M2M links** hand off through a pool buffer and the next stage queue.
//! - **Buffer ledger**: every pool buffer a frame holds is tracked with the
//!   stages still reading it, and released when the last one finishes.
//! - **Enum dispatch on the hot path**: `BuiltinStage` for built-in handlers,
//!   boxed [`StagePlugin`]s for the rest.

pub mod bridge;
pub mod factory;
pub mod frame;
pub mod id;
pub mod monitor;
pub mod node;
pub mod nodes;
pub mod queue;
pub mod selector;
pub mod worker;

pub use bridge::{CaptureEvent, ChannelSink, EventReceiver, ResultSink};
pub use factory::{FrameFactory, FrameListener, FrameTable, StageRouting};
pub use frame::{ClientOutput, Frame, StageEntity};
pub use id::{FrameCount, StreamId};
pub use monitor::{Monitor, MonitorHooks};
pub use node::{AnyStage, BuiltinStage, StageContext, StageJob, StagePlugin};
pub use nodes::StageRegistry;
pub use queue::{PopResult, StageQueue};
pub use selector::{FrameSelector, HeldRaw, SelectTarget, SelectorStats};
pub use worker::{HealthSnapshot, StageHealth, StageWorker, WorkerState};
