pub mod change_feed;
pub mod db;

pub use db::PgBackend;
