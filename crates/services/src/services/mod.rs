pub mod board_api;
pub mod board_cache;
pub mod reorder;
