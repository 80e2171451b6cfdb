mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::{load_class_names, ScriptedBackend};
pub use result::{BBox, Detection};

#[cfg(feature = "backend-tract")]
pub use backends::TractYoloBackend;
