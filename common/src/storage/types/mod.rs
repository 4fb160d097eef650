pub mod conversation;
pub mod group;
pub mod ingestion_task;
pub mod knowledge_entry;
pub mod passage;
pub mod principal;
