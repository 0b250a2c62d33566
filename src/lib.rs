pub mod aggregator;
pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod rate;
pub mod scheduler;
pub mod session;

pub use capture::{CapturedFrame, DirectoryFrameSource, FrameSource};
pub use config::SessionConfig;
pub use error::{Result, StreamError};
pub use session::{Alert, SessionController, SessionEvent, SessionSnapshot};
