pub mod audio;
pub mod realtime;
pub mod tts;
