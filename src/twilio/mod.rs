pub mod client;
pub mod media;
pub mod twiml;
pub mod webhook;
