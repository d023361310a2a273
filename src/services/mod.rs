//! Service layer: the upload-session core and its storage collaborators.

pub mod object_store;
pub mod staging;
pub mod upload_service;
