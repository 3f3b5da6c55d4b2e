pub mod loader;
pub mod player;
pub mod stats;
pub mod tempo;
pub mod timeline;
pub mod track_data;
pub mod utils;
