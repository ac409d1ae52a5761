pub mod markdown_loader;

pub use markdown_loader::{document_id_from_path, load_all_markdown_files, load_markdown_source};
