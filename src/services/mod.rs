pub mod classify_service;
pub mod dependency_service;
pub mod segment_service;
pub mod syllabus_service;
pub mod tagging_service;

pub use classify_service::{Classification, ClassifyService};
pub use dependency_service::{DependencyService, Resolution};
pub use segment_service::SegmentService;
pub use syllabus_service::SyllabusService;
pub use tagging_service::{cosine_similarity, TaggingService};
