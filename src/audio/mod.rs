//! Audio capture, playback, and echo cancellation via cpal.

pub mod aec;
pub mod capture;
pub mod playback;
