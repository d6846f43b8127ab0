//! Detection: frame preparation, model and buffer sharing, concurrency
//! admission and the per-stream workers that feed the recording trigger.

mod admission;
mod backend;
pub mod backends;
mod cache;
mod model;
mod motion;
mod pipeline;
mod pool;
mod prep;
mod registry;
mod result;
mod worker;

pub use admission::{AdmissionGuard, DetectionAdmission};
pub use backend::{DetectionCapability, DetectorBackend, FrameLayout, InputSpec};
pub use backends::{MotionBackend, StubBackend, StubLoader};
pub use cache::{ModelCache, ModelCacheStats};
pub use model::{
    resolve_model_path, LoadedModel, ModelKind, ModelLoader, ModelSpec, API_MODEL, MOTION_MODEL,
};
pub use motion::{MotionConfig, MotionDetector, MotionOutcome};
pub use pipeline::{DetectionPipeline, DetectionTrigger, PipelineStats};
pub use pool::{BufferPool, PoolStats, PooledBuffer, POOL_SLOTS};
pub use prep::{prepare, target_size, PreparedFrame, MAX_SIDE};
pub use registry::LoaderRegistry;
pub use result::{Detection, DetectionResult, MOTION_LABEL};
pub use worker::DetectionWorker;
