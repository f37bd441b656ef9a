/*!
 * Database module for the persistent translation queue.
 *
 * This module provides SQLite-based persistence for:
 * - Translation requests and their lifecycle state
 * - Per-request diagnostic logs
 * - Runtime settings, media items and statistics
 */

pub mod connection;
pub mod models;
pub mod repository;
pub mod schema;

// Re-export main types
pub use connection::DatabaseConnection;
pub use repository::{InsertOutcome, NewLogEntry, Repository};
