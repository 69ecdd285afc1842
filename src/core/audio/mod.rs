//! Audio container handling.

pub mod ogg;

pub use ogg::OggDemuxer;
