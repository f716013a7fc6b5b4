mod code;
mod fs;
mod knowledge;
mod memory;
mod web;

pub use code::RunPythonCodeTool;
pub use fs::{ListDirectoryTool, ReadFileTool, WriteFileTool, truncate_byte_boundary};
pub use knowledge::SearchKnowledgeTool;
pub use memory::register_memory_tools;
pub use web::{ReadWebsiteJsTool, ReadWebsiteTool};
