//! Domain services used by the HTTP routes and the analysis workers.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence so route handlers can
//! stay focused on request parsing, identity and status mapping.

pub mod analysis;
pub mod analysis_worker;
pub mod analytics;
pub mod directory;
pub mod issue;
pub mod upload;
