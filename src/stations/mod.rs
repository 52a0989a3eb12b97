pub mod directory;
pub mod error;
pub mod html;
pub mod probe;
pub mod source;
