pub mod client;

pub use client::{SqliteClient, SqlitePool, SqliteSettings};
