pub mod buffer;
pub mod filter;
pub mod io;
pub mod plot;

pub use self::buffer::{ImageF32, ImageRgbF32};
pub use self::io::{load_input_frames, write_json_file, InputBatch};
