pub mod document_text;
pub mod image_parsing;
pub mod llm_instructions;
