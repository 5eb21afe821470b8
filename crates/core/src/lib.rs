// crates/core/src/lib.rs
pub mod abort;
pub mod broker;
pub mod config;
pub mod error;
pub mod model;
pub mod operator;
pub mod panel;
pub mod progress;
pub mod registry;
pub mod tail;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use abort::{AbortCoordinator, AbortDecision, Confirm};
pub use broker::{BrokerEvent, DetachHandle, JobBroker, JobSubscription};
pub use config::Config;
pub use error::*;
pub use model::*;
pub use operator::{DownloadOptions, DownloadRequest, JobOperator, ProgressSession};
pub use panel::JobPanel;
pub use progress::{
    ControllerPhase, Disposer, ProgressConfig, ProgressController, ProgressEvent, ProgressHandle,
    ProgressModel, ProgressUpdate, ProgressViewState,
};
pub use registry::JobRegistry;
pub use tail::{LogBuffer, LogTail};
pub use transport::{ChannelMessage, JobTransport};
