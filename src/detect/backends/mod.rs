pub mod motion;
pub mod stub;

#[cfg(feature = "api-detection")]
pub mod api;
#[cfg(feature = "backend-tract")]
pub mod tract;

pub use motion::MotionBackend;
pub use stub::{StubBackend, StubLoader};

#[cfg(feature = "api-detection")]
pub use api::{ApiBackend, ApiLoader};
#[cfg(feature = "backend-tract")]
pub use tract::{TractBackend, TractLoader};
