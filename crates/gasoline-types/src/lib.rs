//! Wire data model shared by the capture store and the HTTP/JSON-RPC surface.
//!
//! Everything here is plain serde data. Field names follow the snake_case wire
//! format; camelCase spellings the browser extension still emits are accepted
//! through aliases.

pub mod actions;
pub mod alert;
pub mod api;
pub mod extension;
pub mod lenient;
pub mod log;
pub mod network;
pub mod performance;
pub mod query;
pub mod websocket;

pub use actions::EnhancedAction;
pub use alert::{Alert, AlertSeverity, CiFailure, CiResult};
pub use api::{
    ApiError, HealthBuffers, HealthCircuit, HealthExtension, HealthLogs, HealthResponse,
    IngestResponse, LogsPostResponse, PendingQueriesResponse, ScreenshotSaved, ScreenshotUpload,
    StatusOk, UpgradeMarker, split_ingest_body,
};
pub use extension::{ExtensionLogEntry, ExtensionStatusPost, TrackingStatus};
pub use log::{LogEntry, LogLevel};
pub use network::{NetworkBody, NetworkWaterfallEntry, WaterfallBatch};
pub use performance::{
    BaselineNetwork, BaselineTiming, LongTaskMetrics, NetworkSummary, PerformanceBaseline,
    PerformanceSnapshot, PerformanceTiming, SlowRequest, TypeSummary,
};
pub use query::{CommandResult, CommandStatus, PendingQuery, PendingQueryResponse, ResultPost};
pub use websocket::{
    ClosedConnection, DirectionStats, SamplingInfo, WebSocketConnection, WebSocketEvent,
    WebSocketStatus, WsDirection, WsEventKind,
};
