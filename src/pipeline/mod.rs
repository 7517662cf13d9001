pub mod camera;
pub mod classifier;
pub mod decode;
pub mod landmarks;
pub mod recognizer;
pub mod skeleton;

pub use camera::{CameraProvider, CaptureError, FrameSource, SupervisedCamera};
pub use classifier::{LoadedModel, ModelSearch, OrtSignClassifier, SignClassifier};
pub use landmarks::{HandTracker, OrtHandTracker};
pub use recognizer::{FrameOutcome, RecognitionStatus, Recognizer, outcome_for_hands};
