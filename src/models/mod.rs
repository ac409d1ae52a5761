pub mod document;
pub mod loaders;
pub mod question;
pub mod taxonomy;

pub use document::{Document, DocumentSource};
pub use loaders::{load_all_markdown_files, load_markdown_source};
pub use question::{
    snippet_of, Independence, QuestionBlock, QuestionRecord, QuestionType, RecordId, RecordStatus,
    SubBlock, TopicTag, SNIPPET_LEN,
};
pub use taxonomy::{LabelEmbedding, Taxonomy, TopicNode};
