pub mod document;
pub mod rect;

pub use document::*;
pub use rect::*;
