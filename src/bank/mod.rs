pub mod index;
pub mod store;

pub use index::{QuestionBank, QuestionFilter, SearchHit, SubtopicGroup, TopicGroup, TopicView};
pub use store::{StoredSyllabus, WorkspaceStore};
