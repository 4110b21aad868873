pub mod catalog;
pub mod clicks;
pub mod config;
pub mod item;
pub mod metadata;
pub mod platform;
pub mod playlist;
pub mod protocol;
pub mod state;
pub mod store;
